// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]
#![allow(clippy::missing_errors_doc)]

//! Stateful IPv4 flow rewriter.
//!
//! This package implements a packet-processing element that rewrites the
//! 5-tuple of TCP and UDP packets according to configured patterns. Rewrites
//! are stateful: the first packet of a flow binds a forward/reverse
//! [`Mapping`] pair, reverse-direction traffic is rewritten consistently
//! through the same pair, and idle pairs are garbage-collected by a periodic
//! sweep.
//!
//! Per-input behavior for unmapped flows is configured with an [`InputSpec`]:
//! forward unchanged, drop, bind a new mapping from a [`Pattern`], or
//! delegate to an external [`FlowMapper`].
//!
//! # Limitations
//!
//! - Only IPv4 TCP and UDP are handled; anything else is rejected at packet
//!   parse time.
//! - Fragments are not reassembled; each packet is rewritten on its own.
//! - Mappings track "saw traffic recently", not transport connection state.

pub mod config;
mod flow;
mod mapper;
mod mapping;
mod pattern;
mod rewriter;
mod table;

pub use config::{ConfigError, InputSpec, MapperRegistry, PatternRegistry};
pub use flow::{FlowId, Proto};
pub use mapper::FlowMapper;
pub use mapping::{Direction, Mapping, MappingPair};
pub use pattern::{Pattern, PatternError, PortRange};
pub use rewriter::{DEFAULT_GC_INTERVAL, Emit, Rewriter};
pub use table::{MapRef, PairId};
