// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! One direction of a bound flow, and the forward/reverse pair.

use crate::flow::FlowId;
use crate::pattern::Pattern;
use net::checksum::ChecksumDelta;
use net::headers::Transport;
use net::packet::Packet;
use net::tcp::port::TcpPort;
use net::udp::port::UdpPort;
use std::sync::Arc;

/// Which half of a [`MappingPair`] a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The forward half: keyed by the pre-rewrite inbound flow.
    Forward,
    /// The reverse half: keyed by the reverse of the rewritten outbound flow.
    Reverse,
}

/// A rewrite rule in one direction.
///
/// Applying the mapping overwrites the packet's 5-tuple with `rewrite_to` and
/// patches the IP and transport checksums with deltas precomputed at
/// construction, then marks the mapping used for the current GC interval.
#[derive(Debug)]
pub struct Mapping {
    rewrite_to: FlowId,
    output: usize,
    ip_delta: ChecksumDelta,
    transport_delta: ChecksumDelta,
    used: bool,
    direction: Direction,
    pattern: Option<Arc<Pattern>>,
    ring_slot: Option<usize>,
}

impl Mapping {
    fn new(
        input: &FlowId,
        rewrite_to: FlowId,
        output: usize,
        direction: Direction,
        pattern: Option<Arc<Pattern>>,
        ring_slot: Option<usize>,
    ) -> Self {
        // The IP header checksum covers the two addresses; the TCP/UDP
        // checksum additionally covers both ports (the addresses via the
        // pseudo-header), so its delta extends the IP delta.
        let ip_delta = ChecksumDelta::new()
            .update32(u32::from(input.saddr()), u32::from(rewrite_to.saddr()))
            .update32(u32::from(input.daddr()), u32::from(rewrite_to.daddr()));
        let transport_delta = ip_delta
            .update16(input.sport(), rewrite_to.sport())
            .update16(input.dport(), rewrite_to.dport());
        Self {
            rewrite_to,
            output,
            ip_delta,
            transport_delta,
            used: false,
            direction,
            pattern,
            ring_slot,
        }
    }

    /// The outbound flow this mapping produces.
    #[must_use]
    pub fn rewrite_to(&self) -> &FlowId {
        &self.rewrite_to
    }

    /// The output port downstream packets take.
    #[must_use]
    pub fn output(&self) -> usize {
        self.output
    }

    /// Whether this mapping saw traffic since the last GC sweep.
    #[must_use]
    pub fn used(&self) -> bool {
        self.used
    }

    /// Which half of its pair this mapping is.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn pattern(&self) -> Option<&Arc<Pattern>> {
        self.pattern.as_ref()
    }

    pub(crate) fn ring_slot(&self) -> Option<usize> {
        self.ring_slot
    }

    pub(crate) fn mark_used(&mut self) {
        self.used = true;
    }

    pub(crate) fn clear_used(&mut self) {
        self.used = false;
    }

    /// Rewrite `packet` in place: addresses, ports, and checksums.
    ///
    /// A UDP checksum of zero means "no checksum" on the wire and is left as
    /// zero.
    pub fn apply(&mut self, packet: &mut Packet) {
        let headers = packet.headers_mut();

        let ipv4 = headers.ipv4_mut();
        ipv4.set_source(self.rewrite_to.saddr());
        ipv4.set_destination(self.rewrite_to.daddr());
        let patched = self.ip_delta.apply_to(ipv4.checksum());
        ipv4.set_checksum(patched);

        match headers.transport_mut() {
            Transport::Tcp(tcp) => {
                tcp.set_source(
                    TcpPort::new_checked(self.rewrite_to.sport())
                        .unwrap_or_else(|_| unreachable!()),
                );
                tcp.set_destination(
                    TcpPort::new_checked(self.rewrite_to.dport())
                        .unwrap_or_else(|_| unreachable!()),
                );
                let patched = self.transport_delta.apply_to(tcp.checksum());
                tcp.set_checksum(patched);
            }
            Transport::Udp(udp) => {
                udp.set_source(
                    UdpPort::new_checked(self.rewrite_to.sport())
                        .unwrap_or_else(|_| unreachable!()),
                );
                udp.set_destination(
                    UdpPort::new_checked(self.rewrite_to.dport())
                        .unwrap_or_else(|_| unreachable!()),
                );
                if udp.checksum() != 0 {
                    let patched = self.transport_delta.apply_to(udp.checksum());
                    udp.set_checksum(patched);
                }
            }
        }

        self.used = true;
    }
}

/// A forward/reverse mapping pair. The two halves are created, stored, and
/// destroyed together.
#[derive(Debug)]
pub struct MappingPair {
    forward: Mapping,
    reverse: Mapping,
}

impl MappingPair {
    /// Build both halves for a flow rewritten `input` -> `output_flow`.
    ///
    /// The forward half maps `input` to `output_flow` and emits on `foutput`;
    /// the reverse half maps `output_flow.reverse()` back to
    /// `input.reverse()` and emits on `routput`. Only the forward half links
    /// into a pattern's ring (`ring_slot`).
    #[must_use]
    pub fn new(
        input: FlowId,
        output_flow: FlowId,
        pattern: Option<&Arc<Pattern>>,
        ring_slot: Option<usize>,
        foutput: usize,
        routput: usize,
    ) -> Self {
        let forward = Mapping::new(
            &input,
            output_flow,
            foutput,
            Direction::Forward,
            pattern.cloned(),
            ring_slot,
        );
        let reverse = Mapping::new(
            &output_flow.reverse(),
            input.reverse(),
            routput,
            Direction::Reverse,
            pattern.cloned(),
            None,
        );
        Self { forward, reverse }
    }

    /// The forward half.
    #[must_use]
    pub fn forward(&self) -> &Mapping {
        &self.forward
    }

    /// The reverse half.
    #[must_use]
    pub fn reverse(&self) -> &Mapping {
        &self.reverse
    }

    /// One half, by direction.
    #[must_use]
    pub fn get(&self, direction: Direction) -> &Mapping {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Reverse => &self.reverse,
        }
    }

    pub(crate) fn get_mut(&mut self, direction: Direction) -> &mut Mapping {
        match direction {
            Direction::Forward => &mut self.forward,
            Direction::Reverse => &mut self.reverse,
        }
    }

    /// The table key of the forward half: the pre-rewrite inbound flow.
    #[must_use]
    pub fn forward_key(&self) -> FlowId {
        self.reverse.rewrite_to.reverse()
    }

    /// The table key of the reverse half: the reverse of the rewritten
    /// outbound flow, so return traffic matches.
    #[must_use]
    pub fn reverse_key(&self) -> FlowId {
        self.forward.rewrite_to.reverse()
    }

    /// True when neither half saw traffic since the last sweep.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.forward.used && !self.reverse.used
    }

    pub(crate) fn clear_used(&mut self) {
        self.forward.clear_used();
        self.reverse.clear_used();
    }
}
