// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Builders for well-formed test packets.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::missing_panics_doc
)]

use crate::packet::Packet;
use etherparse::PacketBuilder;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Build an Ipv4 address from a `&str`.
#[must_use]
pub fn addr_v4(a: &str) -> Ipv4Addr {
    Ipv4Addr::from_str(a).expect("Bad IPv4 address")
}

/// Builds a UDP/IPv4 packet with valid checksums.
#[must_use]
pub fn build_test_udp_packet(
    src_ip: &str,
    dst_ip: &str,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Packet {
    let builder = PacketBuilder::ipv4(addr_v4(src_ip).octets(), addr_v4(dst_ip).octets(), 64)
        .udp(sport, dport);
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, payload).expect("packet build failed");
    Packet::new(buf).expect("built packet must parse")
}

/// Builds a TCP/IPv4 packet with valid checksums.
#[must_use]
pub fn build_test_tcp_packet(
    src_ip: &str,
    dst_ip: &str,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Packet {
    let builder = PacketBuilder::ipv4(addr_v4(src_ip).octets(), addr_v4(dst_ip).octets(), 64)
        .tcp(sport, dport, 1000, 4096);
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, payload).expect("packet build failed");
    Packet::new(buf).expect("built packet must parse")
}
