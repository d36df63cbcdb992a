// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rewrite patterns and their source-port allocator.
//!
//! A [`Pattern`] is an immutable rewrite template: each field either names a
//! replacement value or preserves the corresponding field of the input flow.
//! When the pattern rewrites the source port it also acts as an allocator,
//! tracking which ports in its range are bound to live mappings.
//!
//! The allocator state is a circular doubly-linked ring of in-use source
//! ports, kept sorted ascending modulo the ring, plus a *rover* cursor. New
//! ports are taken from the first gap after the rover, which approximates
//! FIFO reuse of port numbers and so minimizes collisions with
//! recently-closed connections. The ring is stored as an arena of nodes
//! addressed by index; mappings hold their node's index, never a pointer.

use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::num::NonZero;
use std::sync::Mutex;
use tracing::trace;

use crate::flow::FlowId;

/// An inclusive, non-empty source-port range. Port zero is never allocatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    lo: u16,
    hi: u16,
}

/// Errors which may occur when building a [`PortRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// The range's low bound exceeds its high bound.
    #[error("descending port range {0}-{1}")]
    DescendingRange(u16, u16),
    /// Port zero cannot be allocated.
    #[error("port range may not contain zero")]
    ZeroPort,
}

impl PortRange {
    /// Create a range, validating `1 <= lo <= hi`.
    pub fn new(lo: u16, hi: u16) -> Result<Self, PatternError> {
        if lo == 0 {
            return Err(PatternError::ZeroPort);
        }
        if lo > hi {
            return Err(PatternError::DescendingRange(lo, hi));
        }
        Ok(Self { lo, hi })
    }

    /// The low bound.
    #[must_use]
    pub fn lo(&self) -> u16 {
        self.lo
    }

    /// The high bound.
    #[must_use]
    pub fn hi(&self) -> u16 {
        self.hi
    }

    fn is_single(self) -> bool {
        self.lo == self.hi
    }

    fn contains(self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }

    fn overlaps(self, other: PortRange) -> bool {
        self.contains(other.lo) || other.contains(self.lo)
    }

    fn covers(self, other: PortRange) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }
}

/// A node of the in-use ring. `prev`/`next` are arena indices.
#[derive(Debug, Clone, Copy)]
struct RingNode {
    sport: u16,
    prev: usize,
    next: usize,
}

/// The allocator's mutable state: an arena-backed circular list plus the
/// rover.
#[derive(Debug, Default)]
struct Ring {
    nodes: Vec<Option<RingNode>>,
    free: Vec<usize>,
    rover: Option<usize>,
}

impl Ring {
    fn node(&self, slot: usize) -> RingNode {
        match self.nodes.get(slot) {
            Some(Some(node)) => *node,
            _ => unreachable!("ring slot {slot} is vacant"),
        }
    }

    fn alloc_slot(&mut self, node: RingNode) -> usize {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// Insert `sport` just after the rover (or as the sole node of an empty
    /// ring) and advance the rover to it.
    fn insert_after_rover(&mut self, sport: u16) -> usize {
        let slot = match self.rover {
            None => {
                let slot = self.alloc_slot(RingNode {
                    sport,
                    prev: 0,
                    next: 0,
                });
                match &mut self.nodes[slot] {
                    Some(node) => {
                        node.prev = slot;
                        node.next = slot;
                    }
                    None => unreachable!(),
                }
                slot
            }
            Some(rover) => {
                let next = self.node(rover).next;
                let slot = self.alloc_slot(RingNode {
                    sport,
                    prev: rover,
                    next,
                });
                match &mut self.nodes[rover] {
                    Some(node) => node.next = slot,
                    None => unreachable!(),
                }
                match &mut self.nodes[next] {
                    Some(node) => node.prev = slot,
                    None => unreachable!(),
                }
                slot
            }
        };
        self.rover = Some(slot);
        slot
    }

    /// Unlink `slot`. If the rover pointed at it, the rover advances to its
    /// successor, or clears if the ring became empty.
    fn remove(&mut self, slot: usize) {
        let node = self.node(slot);
        if node.next == slot {
            self.rover = None;
        } else {
            match &mut self.nodes[node.prev] {
                Some(prev) => prev.next = node.next,
                None => unreachable!(),
            }
            match &mut self.nodes[node.next] {
                Some(next) => next.prev = node.prev,
                None => unreachable!(),
            }
            if self.rover == Some(slot) {
                self.rover = Some(node.next);
            }
        }
        self.nodes[slot] = None;
        self.free.push(slot);
    }

    /// Find a free port in `range`, starting just after the rover and
    /// wrapping from `hi` to `lo`. Leaves the rover at the node preceding the
    /// gap the port was taken from. Returns `None` if the range is exhausted.
    ///
    /// Ring nodes carrying ports outside `range` (possible when a pattern is
    /// reused across reconfigurations) are stepped over and never block an
    /// in-range gap.
    fn find_free_port(&mut self, range: PortRange) -> Option<u16> {
        let start = self.rover?;
        let mut at = start;
        loop {
            let node = self.node(at);
            let this = node.sport;
            let next = self.node(node.next).sport;
            // `next <= this` marks the ring's wrap point (or a single-node
            // ring); the gap after `this` then runs through `hi` and resumes
            // at `lo`.
            let wrapped = next <= this;
            let candidate = if this < range.lo {
                Some(range.lo)
            } else if this < range.hi {
                Some(this + 1)
            } else {
                None
            };

            match candidate {
                Some(candidate) if wrapped || candidate < next => {
                    self.rover = Some(at);
                    return Some(candidate);
                }
                None if wrapped && next > range.lo => {
                    // The gap wraps past `hi`; restart at the bottom.
                    self.rover = Some(at);
                    return Some(range.lo);
                }
                _ => {}
            }

            at = node.next;
            if at == start {
                return None;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.rover.is_none()
    }
}

/// A rewrite template plus its source-port allocator.
///
/// `None` in a template field means "preserve that field from the input
/// flow". Patterns are shared (`Arc`) between the configuration entries and
/// registries that reference them; the allocator ring is serialized behind a
/// mutex so a shared pattern stays coherent.
#[derive(Debug)]
pub struct Pattern {
    saddr: Option<Ipv4Addr>,
    sport: Option<PortRange>,
    daddr: Option<Ipv4Addr>,
    dport: Option<NonZero<u16>>,
    ring: Mutex<Ring>,
}

impl Pattern {
    /// Create a pattern from its template fields.
    #[must_use]
    pub fn new(
        saddr: Option<Ipv4Addr>,
        sport: Option<PortRange>,
        daddr: Option<Ipv4Addr>,
        dport: Option<NonZero<u16>>,
    ) -> Self {
        Self {
            saddr,
            sport,
            daddr,
            dport,
            ring: Mutex::new(Ring::default()),
        }
    }

    /// True if this pattern rewrites the source port.
    #[must_use]
    pub fn rewrites_sport(&self) -> bool {
        self.sport.is_some()
    }

    /// Two patterns *may* produce the same rewritten flow: their constrained
    /// address fields can coexist and their source-port ranges either both
    /// preserve or overlap.
    #[must_use]
    pub fn possible_conflict(&self, other: &Pattern) -> bool {
        fn field_conflict(
            a1: Option<Ipv4Addr>,
            r1: Option<PortRange>,
            a2: Option<Ipv4Addr>,
            r2: Option<PortRange>,
        ) -> bool {
            if let (Some(a1), Some(a2)) = (a1, a2)
                && a1 != a2
            {
                return false;
            }
            match (r1, r2) {
                (Some(r1), Some(r2)) => r1.overlaps(r2),
                _ => true,
            }
        }
        let dport_range = |p: Option<NonZero<u16>>| {
            p.map(|p| PortRange {
                lo: p.get(),
                hi: p.get(),
            })
        };
        field_conflict(self.saddr, self.sport, other.saddr, other.sport)
            && field_conflict(
                self.daddr,
                dport_range(self.dport),
                other.daddr,
                dport_range(other.dport),
            )
    }

    /// Two patterns *will* collide: both fully constrain source address,
    /// destination address, and destination port identically, and one
    /// source-port range contains the other.
    #[must_use]
    pub fn definite_conflict(&self, other: &Pattern) -> bool {
        match (
            self.saddr,
            self.sport,
            self.daddr,
            self.dport,
            other.sport,
        ) {
            (Some(saddr), Some(sport), Some(daddr), Some(dport), Some(other_sport)) => {
                Some(saddr) == other.saddr
                    && Some(daddr) == other.daddr
                    && Some(dport) == other.dport
                    && (sport.covers(other_sport) || other_sport.covers(sport))
            }
            _ => false,
        }
    }

    /// Compute the rewritten flow for `input`, allocating a source port if
    /// this pattern rewrites one, and link the allocation into the in-use
    /// ring. Returns the outbound flow and the ring slot to hand to
    /// [`Pattern::mapping_freed`] later.
    ///
    /// Returns `None` when the source-port range is exhausted.
    pub(crate) fn allocate(&self, input: &FlowId) -> Option<(FlowId, usize)> {
        let mut ring = self.ring.lock().unwrap();
        let sport = match self.sport {
            None => input.sport(),
            Some(range) => {
                // A single-value range always "succeeds": collisions on the
                // rewritten 5-tuple are accepted (there is no other choice).
                if range.is_single() || ring.is_empty() {
                    range.lo
                } else {
                    let Some(port) = ring.find_free_port(range) else {
                        trace!("source port range {}-{} exhausted", range.lo, range.hi);
                        return None;
                    };
                    port
                }
            }
        };
        let out = FlowId::new(
            self.saddr.unwrap_or(input.saddr()),
            sport,
            self.daddr.unwrap_or(input.daddr()),
            self.dport.map_or(input.dport(), NonZero::get),
        );
        let slot = ring.insert_after_rover(sport);
        Some((out, slot))
    }

    /// Unlink a freed mapping's ring slot. The rover never dangles: if it
    /// pointed at the freed node it advances, or clears on an emptied ring.
    pub(crate) fn mapping_freed(&self, slot: usize) {
        self.ring.lock().unwrap().remove(slot);
    }

    #[cfg(test)]
    fn in_use_ports(&self) -> Vec<u16> {
        let ring = self.ring.lock().unwrap();
        let Some(start) = ring.rover else {
            return Vec::new();
        };
        let mut ports = Vec::new();
        let mut at = start;
        loop {
            let node = ring.node(at);
            ports.push(node.sport);
            at = node.next;
            if at == start {
                break;
            }
        }
        ports
    }
}

impl Display for Pattern {
    /// `SADDR:SPORT / DADDR:DPORT`, with `-` for preserved fields and
    /// `LO-HI` for a port range.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.saddr {
            Some(addr) => write!(f, "{addr}:")?,
            None => write!(f, "-:")?,
        }
        match self.sport {
            None => write!(f, "-")?,
            Some(range) if range.is_single() => write!(f, "{}", range.lo)?,
            Some(range) => write!(f, "{}-{}", range.lo, range.hi)?,
        }
        match self.daddr {
            Some(addr) => write!(f, " / {addr}:")?,
            None => write!(f, " / -:")?,
        }
        match self.dport {
            Some(port) => write!(f, "{port}"),
            None => write!(f, "-"),
        }
    }
}
