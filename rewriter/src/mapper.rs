// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The external mapper capability.

use crate::flow::{FlowId, Proto};
use crate::pattern::Pattern;
use crate::rewriter::Rewriter;
use crate::table::MapRef;
use std::sync::Arc;

/// A pluggable collaborator that supplies mappings for flows the rewriter has
/// no pattern for (load balancers, for example).
///
/// The capability is deliberately narrow: supply a mapping on a miss, and
/// optionally expose the patterns it allocates from so configuration can
/// screen them for conflicts.
pub trait FlowMapper: Send + Sync {
    /// Called on a lookup miss for `flow` on an input configured to delegate
    /// to this mapper.
    ///
    /// A mapper that wants the packet rewritten must build a
    /// [`MappingPair`](crate::MappingPair), install it with
    /// [`Rewriter::install`], and return the reference `install` handed back
    /// (the forward half). Returning `None` drops the packet.
    fn get_map(&self, proto: Proto, flow: &FlowId, rewriter: &mut Rewriter) -> Option<MapRef>;

    /// The patterns this mapper allocates from, if any, for configure-time
    /// conflict screening.
    fn mapper_patterns(&self) -> Vec<Arc<Pattern>> {
        Vec::new()
    }
}
