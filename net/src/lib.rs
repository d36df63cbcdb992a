// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IPv4/TCP/UDP header handling for the flow rewriter.
//!
//! This crate provides the packet-facing half of the rewriter: typed wrappers
//! around [`etherparse`] headers with the accessors a rewriter touches
//! (addresses, ports, checksums), a [`Packet`](packet::Packet) type that pairs
//! a raw buffer with its parsed headers, and one's-complement checksum
//! arithmetic for incremental (RFC 1624) checksum maintenance.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod checksum;
pub mod headers;
pub mod ipv4;
pub mod packet;
pub mod parse;
pub mod tcp;
pub mod udp;
