// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The rewriter engine: per-packet path, mapping installation, and the
//! garbage collector.

use crate::config::{ConfigError, InputSpec};
use crate::flow::{FlowId, Proto};
use crate::mapping::{Direction, Mapping, MappingPair};
use crate::pattern::Pattern;
use crate::table::{MapRef, MappingTable, PairId, hasher_state};
use ahash::RandomState;
use net::packet::Packet;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default period of the garbage-collection sweep.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);

/// A rewritten (or passed-through) packet and the output port it takes.
#[derive(Debug)]
pub struct Emit {
    /// The output port index.
    pub output: usize,
    /// The packet, possibly rewritten in place.
    pub packet: Packet,
}

/// The stateful flow rewriter.
///
/// Packets enter through [`Rewriter::push`] with the index of the input port
/// they arrived on. A packet whose flow is already mapped is rewritten
/// through the existing mapping regardless of input; an unmapped packet is
/// handled by its input's [`InputSpec`]. Idle mapping pairs are reclaimed by
/// [`Rewriter::sweep`], driven by the host clock through
/// [`Rewriter::tick`].
///
/// The engine is single-writer: the host calls `push`, `tick`, and the other
/// mutating entry points from one logical executor, and a sweep never
/// interleaves with a packet.
#[derive(Debug)]
pub struct Rewriter {
    input_specs: Vec<InputSpec>,
    noutputs: usize,
    tcp: MappingTable,
    udp: MappingTable,
    pairs: HashMap<PairId, MappingPair, RandomState>,
    next_pair: u64,
    gc_interval: Duration,
    next_sweep: Instant,
}

impl Rewriter {
    /// Build a rewriter with one [`InputSpec`] per input port and `noutputs`
    /// output ports, sweeping every [`DEFAULT_GC_INTERVAL`].
    pub fn new(input_specs: Vec<InputSpec>, noutputs: usize) -> Result<Self, ConfigError> {
        Self::with_gc_interval(input_specs, noutputs, DEFAULT_GC_INTERVAL)
    }

    /// As [`Rewriter::new`], with an explicit GC interval.
    pub fn with_gc_interval(
        input_specs: Vec<InputSpec>,
        noutputs: usize,
        gc_interval: Duration,
    ) -> Result<Self, ConfigError> {
        validate_outputs(&input_specs, noutputs)?;
        screen_patterns(&input_specs)?;
        Ok(Self {
            input_specs,
            noutputs,
            tcp: MappingTable::new(),
            udp: MappingTable::new(),
            pairs: HashMap::with_hasher(hasher_state().clone()),
            next_pair: 0,
            gc_interval,
            next_sweep: Instant::now() + gc_interval,
        })
    }

    /// The number of output ports.
    #[must_use]
    pub fn noutputs(&self) -> usize {
        self.noutputs
    }

    /// Process one packet arriving on input port `input`.
    ///
    /// Returns the packet and its output port, or `None` if the packet was
    /// dropped (no policy produced a mapping, or the input's port range is
    /// exhausted).
    pub fn push(&mut self, input: usize, packet: Packet) -> Option<Emit> {
        let (proto, flow) = FlowId::of_packet(packet.headers());

        // Hot path: an existing mapping prevails over the input spec, which
        // is what makes reverse-direction traffic work from any input.
        if let Some(map_ref) = self.table(proto).find(&flow) {
            return self.apply_and_emit(map_ref, packet);
        }

        let Some(spec) = self.input_specs.get(input).cloned() else {
            debug_assert!(false, "packet on unconfigured input {input}");
            trace!("drop: packet on unconfigured input {input}");
            return None;
        };

        let map_ref = match spec {
            InputSpec::NoChange { output } => {
                return Some(Emit { output, packet });
            }
            InputSpec::Drop => None,
            InputSpec::Pattern {
                pattern,
                foutput,
                routput,
            } => self.create_from_pattern(&pattern, proto, &flow, foutput, routput),
            InputSpec::Mapper { mapper } => mapper.get_map(proto, &flow, self),
        };

        match map_ref {
            Some(map_ref) => self.apply_and_emit(map_ref, packet),
            None => {
                trace!("drop: no mapping for {proto} {flow} on input {input}");
                None
            }
        }
    }

    /// Bind a pair from `pattern` for `flow`, or fail when the pattern's port
    /// range is exhausted.
    fn create_from_pattern(
        &mut self,
        pattern: &Arc<Pattern>,
        proto: Proto,
        flow: &FlowId,
        foutput: usize,
        routput: usize,
    ) -> Option<MapRef> {
        let (out_flow, ring_slot) = pattern.allocate(flow)?;
        let pair = MappingPair::new(
            *flow,
            out_flow,
            Some(pattern),
            Some(ring_slot),
            foutput,
            routput,
        );
        Some(self.install(proto, pair))
    }

    /// Install a mapping pair under both of its table keys and take ownership
    /// of it. Both directions become visible atomically with respect to
    /// subsequent lookups.
    ///
    /// External mappers call this from
    /// [`FlowMapper::get_map`](crate::FlowMapper::get_map) before returning
    /// the forward reference this hands back.
    pub fn install(&mut self, proto: Proto, pair: MappingPair) -> MapRef {
        let id = PairId(self.next_pair);
        self.next_pair += 1;
        let forward_key = pair.forward_key();
        let reverse_key = pair.reverse_key();
        debug!(
            "install {proto} mapping {forward_key} => {}",
            pair.forward().rewrite_to()
        );
        let table = self.table_mut(proto);
        table.insert(
            forward_key,
            MapRef {
                pair: id,
                dir: Direction::Forward,
            },
        );
        table.insert(
            reverse_key,
            MapRef {
                pair: id,
                dir: Direction::Reverse,
            },
        );
        self.pairs.insert(id, pair);
        MapRef {
            pair: id,
            dir: Direction::Forward,
        }
    }

    fn apply_and_emit(&mut self, map_ref: MapRef, mut packet: Packet) -> Option<Emit> {
        // The tables and the pair store are kept in sync; a miss here would
        // mean a stale reference escaped a sweep.
        let pair = self.pairs.get_mut(&map_ref.pair)?;
        let mapping = pair.get_mut(map_ref.dir);
        mapping.apply(&mut packet);
        Some(Emit {
            output: mapping.output(),
            packet,
        })
    }

    /// Advance the engine's clock. Runs a sweep when the GC interval has
    /// elapsed; the host calls this between packets.
    pub fn tick(&mut self, now: Instant) {
        if now >= self.next_sweep {
            self.sweep();
            self.next_sweep = now + self.gc_interval;
        }
    }

    /// Reclaim every pair that saw no traffic on either half since the last
    /// sweep, and age the rest.
    pub fn sweep(&mut self) {
        self.sweep_table(Proto::Tcp);
        self.sweep_table(Proto::Udp);
    }

    fn sweep_table(&mut self, proto: Proto) {
        let (table, pairs) = match proto {
            Proto::Tcp => (&mut self.tcp, &mut self.pairs),
            Proto::Udp => (&mut self.udp, &mut self.pairs),
        };

        let mut idle = Vec::new();
        for (_, map_ref) in table.iter() {
            if map_ref.dir != Direction::Forward {
                continue;
            }
            if let Some(pair) = pairs.get_mut(&map_ref.pair) {
                if pair.is_idle() {
                    idle.push(map_ref.pair);
                } else {
                    pair.clear_used();
                }
            }
        }

        for id in idle {
            let Some(pair) = pairs.remove(&id) else {
                continue;
            };
            free_pattern_slot(&pair);
            table.remove(&pair.forward_key());
            table.remove(&pair.reverse_key());
            debug!("swept idle {proto} mapping {}", pair.forward_key());
        }
    }

    /// Mark the TCP mappings of still-open flows as used, shielding them from
    /// the next sweep. The host feeds this from whatever socket source it has
    /// (a kernel walk, a proxy's connection list); the rewriter works without
    /// it at the cost of reclaiming idle-but-open connections.
    pub fn mark_live<I>(&mut self, flows: I)
    where
        I: IntoIterator<Item = FlowId>,
    {
        for flow in flows {
            if let Some(map_ref) = self.tcp.find(&flow)
                && let Some(pair) = self.pairs.get_mut(&map_ref.pair)
            {
                pair.get_mut(map_ref.dir).mark_used();
            }
        }
    }

    /// The number of table entries for `proto`. Every live pair contributes
    /// two entries (one per direction).
    #[must_use]
    pub fn mapping_count(&self, proto: Proto) -> usize {
        self.table(proto).len()
    }

    /// Read-only lookup of the mapping a flow would be rewritten through.
    #[must_use]
    pub fn find_mapping(&self, proto: Proto, flow: &FlowId) -> Option<&Mapping> {
        let map_ref = self.table(proto).find(flow)?;
        Some(self.pairs.get(&map_ref.pair)?.get(map_ref.dir))
    }

    /// One line per forward mapping, `IN-FLOW => OUT-FLOW [OUTPUT]`, grouped
    /// by protocol. Empty groups are omitted.
    #[must_use]
    pub fn dump_mappings(&self) -> String {
        let mut out = String::new();
        for (proto, table) in [(Proto::Tcp, &self.tcp), (Proto::Udp, &self.udp)] {
            let mut lines = String::new();
            for (flow, map_ref) in table.iter() {
                if map_ref.dir != Direction::Forward {
                    continue;
                }
                if let Some(pair) = self.pairs.get(&map_ref.pair) {
                    let mapping = pair.forward();
                    let _ = writeln!(
                        lines,
                        "{flow} => {} [{}]",
                        mapping.rewrite_to(),
                        mapping.output()
                    );
                }
            }
            if !lines.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                let _ = writeln!(out, "{proto}:");
                out.push_str(&lines);
            }
        }
        out
    }

    /// One line per configured pattern, in `SADDR:SPORT / DADDR:DPORT` form.
    #[must_use]
    pub fn dump_patterns(&self) -> String {
        let mut out = String::new();
        for spec in &self.input_specs {
            if let InputSpec::Pattern { pattern, .. } = spec {
                let _ = writeln!(out, "{pattern}");
            }
        }
        out
    }

    /// Drop every mapping pair and unlink every pattern ring. Called on
    /// teardown; the rewriter is empty but still usable afterwards.
    pub fn clear(&mut self) {
        debug!("clearing {} mapping pairs", self.pairs.len());
        for (_, pair) in self.pairs.drain() {
            free_pattern_slot(&pair);
        }
        self.tcp.clear();
        self.udp.clear();
    }

    fn table(&self, proto: Proto) -> &MappingTable {
        match proto {
            Proto::Tcp => &self.tcp,
            Proto::Udp => &self.udp,
        }
    }

    fn table_mut(&mut self, proto: Proto) -> &mut MappingTable {
        match proto {
            Proto::Tcp => &mut self.tcp,
            Proto::Udp => &mut self.udp,
        }
    }
}

impl Drop for Rewriter {
    fn drop(&mut self) {
        self.clear();
    }
}

fn free_pattern_slot(pair: &MappingPair) {
    if let (Some(pattern), Some(slot)) = (pair.forward().pattern(), pair.forward().ring_slot()) {
        pattern.mapping_freed(slot);
    }
}

fn validate_outputs(input_specs: &[InputSpec], noutputs: usize) -> Result<(), ConfigError> {
    let check = |output: usize| {
        if output < noutputs {
            Ok(())
        } else {
            Err(ConfigError::OutputOutOfRange { output, noutputs })
        }
    };
    for spec in input_specs {
        match spec {
            InputSpec::NoChange { output } => check(*output)?,
            InputSpec::Pattern {
                foutput, routput, ..
            } => {
                check(*foutput)?;
                check(*routput)?;
            }
            InputSpec::Drop | InputSpec::Mapper { .. } => {}
        }
    }
    Ok(())
}

/// Screen every configured pattern (including those contributed by mappers)
/// pairwise: definite overlaps are configuration errors, possible overlaps
/// are warnings.
fn screen_patterns(input_specs: &[InputSpec]) -> Result<(), ConfigError> {
    let mut all: Vec<Arc<Pattern>> = Vec::new();
    for spec in input_specs {
        match spec {
            InputSpec::Pattern { pattern, .. } => all.push(pattern.clone()),
            InputSpec::Mapper { mapper } => all.extend(mapper.mapper_patterns()),
            InputSpec::NoChange { .. } | InputSpec::Drop => {}
        }
    }
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            if Arc::ptr_eq(a, b) {
                continue;
            }
            if a.definite_conflict(b) {
                return Err(ConfigError::ConflictingPatterns(
                    a.to_string(),
                    b.to_string(),
                ));
            }
            if a.possible_conflict(b) {
                warn!("patterns may produce overlapping rewrites: `{a}` and `{b}`");
            }
        }
    }
    Ok(())
}
