// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-protocol flow-to-mapping table.

use crate::flow::FlowId;
use ahash::RandomState;
use std::collections::HashMap;
use tracing::debug;

/// Identifier of a [`MappingPair`](crate::MappingPair) in the rewriter's pair
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairId(pub(crate) u64);

/// A reference to one half of a stored mapping pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRef {
    /// The pair the mapping belongs to.
    pub pair: PairId,
    /// Which half.
    pub dir: crate::mapping::Direction,
}

pub(crate) fn hasher_state() -> &'static RandomState {
    use std::sync::OnceLock;
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    // Fixed seeds: iteration order is deterministic within a process run.
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

/// An associative container keying [`FlowId`] to one half of a mapping pair.
///
/// Each live pair appears under two keys: its forward pre-image and its
/// reverse pre-image (see
/// [`MappingPair::forward_key`](crate::MappingPair::forward_key) and
/// [`MappingPair::reverse_key`](crate::MappingPair::reverse_key)).
#[derive(Debug)]
pub(crate) struct MappingTable {
    map: HashMap<FlowId, MapRef, RandomState>,
}

impl MappingTable {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::with_hasher(hasher_state().clone()),
        }
    }

    pub(crate) fn find(&self, flow: &FlowId) -> Option<MapRef> {
        self.map.get(flow).copied()
    }

    pub(crate) fn insert(&mut self, flow: FlowId, map_ref: MapRef) {
        debug!("mapping table insert: {flow}");
        self.map.insert(flow, map_ref);
    }

    pub(crate) fn remove(&mut self, flow: &FlowId) {
        debug!("mapping table remove: {flow}");
        self.map.remove(flow);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&FlowId, &MapRef)> {
        self.map.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }
}
