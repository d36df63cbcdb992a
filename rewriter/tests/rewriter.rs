// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end rewriter scenarios: pattern NAT, reverse traffic, the port
//! allocator under pressure, garbage collection, and mapper delegation.

use iprewriter::{
    FlowId, FlowMapper, InputSpec, MapRef, MapperRegistry, MappingPair, PatternRegistry, Proto,
    Rewriter,
};
use net::headers::Transport;
use net::packet::Packet;
use net::packet::test_utils::{addr_v4, build_test_tcp_packet, build_test_udp_packet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing_test::traced_test;

fn parse_spec(spec: &str) -> InputSpec {
    InputSpec::parse(spec, &PatternRegistry::new(), &MapperRegistry::new())
        .expect("Failed to parse input spec")
}

fn rewriter(specs: &[&str], noutputs: usize) -> Rewriter {
    let specs = specs.iter().map(|s| parse_spec(s)).collect();
    Rewriter::new(specs, noutputs).expect("Failed to build rewriter")
}

fn flow_of(packet: &Packet) -> FlowId {
    let (_, flow) = FlowId::of_packet(packet.headers());
    flow
}

/// Verify the IP header checksum and (when present) the transport checksum
/// against a full RFC 1071 recompute.
fn assert_checksums_valid(packet: &Packet) {
    let ip = packet.headers().ipv4();
    assert_eq!(
        ip.checksum(),
        ip.inner().calc_header_checksum(),
        "ip checksum does not verify"
    );
    match packet.headers().transport() {
        Transport::Tcp(tcp) => {
            let expected = tcp
                .inner()
                .calc_checksum_ipv4(ip.inner(), packet.payload())
                .expect("checksum computable");
            assert_eq!(tcp.checksum(), expected, "tcp checksum does not verify");
        }
        Transport::Udp(udp) => {
            if udp.checksum() != 0 {
                let expected = udp
                    .inner()
                    .calc_checksum_ipv4(ip.inner(), packet.payload())
                    .expect("checksum computable");
                assert_eq!(udp.checksum(), expected, "udp checksum does not verify");
            }
        }
    }
}

#[test]
#[traced_test]
fn basic_snat_and_reply() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-65535 - - 0 1"], 2);

    let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"syn");
    let emit = rw.push(0, packet).expect("forward packet must be emitted");
    assert_eq!(emit.output, 0);
    assert_eq!(
        flow_of(&emit.packet),
        FlowId::new(addr_v4("1.2.3.4"), 1024, addr_v4("8.8.8.8"), 80)
    );
    assert_checksums_valid(&emit.packet);

    // The reply arrives addressed to the rewritten flow; whatever input it
    // lands on, the existing mapping prevails and routes it to output 1.
    let reply = build_test_tcp_packet("8.8.8.8", "1.2.3.4", 80, 1024, b"syn-ack");
    let emit = rw.push(0, reply).expect("reply must be emitted");
    assert_eq!(emit.output, 1);
    assert_eq!(
        flow_of(&emit.packet),
        FlowId::new(addr_v4("8.8.8.8"), 80, addr_v4("10.0.0.5"), 5000)
    );
    assert_checksums_valid(&emit.packet);
}

#[test]
fn existing_mapping_prevails_over_input_spec() {
    // Input 1 is configured to drop, but a mapped flow is rewritten anyway.
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-65535 - - 0 1", "drop"], 2);

    let first = build_test_udp_packet("10.0.0.5", "9.9.9.9", 5000, 53, b"q");
    rw.push(0, first).expect("mapping must be created");

    let second = build_test_udp_packet("10.0.0.5", "9.9.9.9", 5000, 53, b"q2");
    let emit = rw.push(1, second).expect("mapped flow must pass a drop input");
    assert_eq!(emit.output, 0);
    assert_eq!(flow_of(&emit.packet).saddr(), addr_v4("1.2.3.4"));
}

#[test]
#[traced_test]
fn port_allocator_progress() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-1026 - - 0 1"], 2);

    let mut allocated = Vec::new();
    for sport in [5000u16, 5001, 5002] {
        let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", sport, 80, b"x");
        let emit = rw.push(0, packet).expect("allocation must succeed");
        allocated.push(flow_of(&emit.packet).sport());
    }
    assert_eq!(allocated, vec![1024, 1025, 1026]);
    assert_eq!(rw.mapping_count(Proto::Tcp), 6);

    // Range exhausted: the fourth flow is dropped.
    let fourth = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5003, 80, b"x");
    assert!(rw.push(0, fourth).is_none());
    assert_eq!(rw.mapping_count(Proto::Tcp), 6);

    // Free the second mapping through the GC: age every pair once, then keep
    // the first and third alive through the next sweep.
    rw.sweep();
    for sport in [5000u16, 5002] {
        let keepalive = build_test_tcp_packet("10.0.0.5", "8.8.8.8", sport, 80, b"k");
        rw.push(0, keepalive).expect("mapped flow");
    }
    rw.sweep();
    assert_eq!(rw.mapping_count(Proto::Tcp), 4);

    // The freed port is 1025, and the allocator hands exactly it back.
    let fourth = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5003, 80, b"x");
    let emit = rw.push(0, fourth).expect("freed port must be reusable");
    assert_eq!(flow_of(&emit.packet).sport(), 1025);
}

#[test]
#[traced_test]
fn gc_sweep_reclaims_idle_pairs() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-65535 - - 0 1"], 2);

    let packet = build_test_udp_packet("10.0.0.5", "9.9.9.9", 5000, 53, b"q");
    rw.push(0, packet).expect("mapping created");
    assert_eq!(rw.mapping_count(Proto::Udp), 2);

    // Two quiet intervals: the first clears the used bits, the second
    // reclaims the pair.
    rw.sweep();
    assert_eq!(rw.mapping_count(Proto::Udp), 2);
    rw.sweep();
    assert_eq!(rw.mapping_count(Proto::Udp), 0);

    // A fresh flow after reclamation binds a fresh mapping.
    let packet = build_test_udp_packet("10.0.0.5", "9.9.9.9", 5000, 53, b"q");
    rw.push(0, packet).expect("fresh mapping created");
    assert_eq!(rw.mapping_count(Proto::Udp), 2);

    // Traffic on either half shields the pair from the sweep.
    rw.sweep();
    let packet = build_test_udp_packet("10.0.0.5", "9.9.9.9", 5000, 53, b"q");
    rw.push(0, packet).expect("mapped flow");
    rw.sweep();
    assert_eq!(rw.mapping_count(Proto::Udp), 2);
}

#[test]
fn reverse_traffic_shields_pair_from_gc() {
    let mut rw = rewriter(&["pattern 1.2.3.4 2000-2010 - - 0 1"], 2);

    let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"syn");
    rw.push(0, packet).expect("mapping created");

    rw.sweep();
    // Only the reverse half sees traffic during this interval.
    let reply = build_test_tcp_packet("8.8.8.8", "1.2.3.4", 80, 2000, b"ack");
    rw.push(0, reply).expect("reply rewritten");
    rw.sweep();
    assert_eq!(rw.mapping_count(Proto::Tcp), 2, "pair must survive the sweep");
}

#[test]
fn mark_live_shields_quiet_connections() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-65535 - - 0 1"], 2);

    let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"syn");
    rw.push(0, packet).expect("mapping created");
    let live = FlowId::new(addr_v4("10.0.0.5"), 5000, addr_v4("8.8.8.8"), 80);

    // The connection goes quiet but the host still reports it open.
    rw.sweep();
    rw.mark_live([live]);
    rw.sweep();
    assert_eq!(rw.mapping_count(Proto::Tcp), 2);

    // Once the host stops reporting it, two quiet sweeps reclaim it.
    rw.sweep();
    assert_eq!(rw.mapping_count(Proto::Tcp), 0);
}

#[test]
fn drop_spec_drops_unmapped() {
    let mut rw = rewriter(&["drop"], 1);
    let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"syn");
    assert!(rw.push(0, packet).is_none());
    assert_eq!(rw.mapping_count(Proto::Tcp), 0);
    assert_eq!(rw.mapping_count(Proto::Udp), 0);
}

#[test]
fn nochange_spec_forwards_unmodified() {
    let mut rw = rewriter(&["nochange 2"], 3);
    let packet = build_test_udp_packet("10.0.0.5", "9.9.9.9", 5000, 53, b"q");
    let original_bytes = packet.clone().serialize();

    let emit = rw.push(0, packet).expect("nochange must forward");
    assert_eq!(emit.output, 2);
    assert_eq!(
        emit.packet.serialize(),
        original_bytes,
        "packet must be bit-identical, checksums included"
    );
    assert_eq!(rw.mapping_count(Proto::Udp), 0, "no mapping is installed");
}

#[test]
fn all_preserve_pattern_still_binds_a_mapping() {
    let mut rw = rewriter(&["pattern - - - - 0 0"], 1);
    let packet = build_test_udp_packet("10.0.0.5", "9.9.9.9", 5000, 53, b"q");
    let original_bytes = packet.clone().serialize();

    let emit = rw.push(0, packet).expect("identity rewrite still emits");
    assert_eq!(flow_of(&emit.packet).saddr(), addr_v4("10.0.0.5"));
    assert_eq!(
        emit.packet.serialize(),
        original_bytes,
        "identity rewrite must leave bytes unchanged"
    );
    assert_eq!(rw.mapping_count(Proto::Udp), 2, "mapping is still installed");
}

#[test]
fn single_value_port_range_always_binds() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024 - - 0 1"], 2);
    for sport in [5000u16, 5001, 5002] {
        let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", sport, 80, b"x");
        let emit = rw.push(0, packet).expect("single-value range never fails");
        assert_eq!(flow_of(&emit.packet).sport(), 1024);
    }
}

#[test]
fn udp_zero_checksum_survives_rewrite() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-65535 - - 0 1"], 2);

    let mut packet = build_test_udp_packet("10.0.0.5", "9.9.9.9", 5000, 53, b"q");
    if let Transport::Udp(udp) = packet.headers_mut().transport_mut() {
        udp.set_checksum(0);
    }

    let emit = rw.push(0, packet).expect("rewritten");
    let Transport::Udp(udp) = emit.packet.headers().transport() else {
        unreachable!()
    };
    assert_eq!(udp.checksum(), 0, "no-checksum datagram must stay that way");
    assert_eq!(flow_of(&emit.packet).saddr(), addr_v4("1.2.3.4"));
}

#[test]
fn tcp_and_udp_tables_are_independent() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-1024 - - 0 1"], 2);

    let tcp = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"x");
    let udp = build_test_udp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"x");
    rw.push(0, tcp).expect("tcp mapping");
    rw.push(0, udp).expect("udp mapping");

    assert_eq!(rw.mapping_count(Proto::Tcp), 2);
    assert_eq!(rw.mapping_count(Proto::Udp), 2);
}

/// A mapper that pins every flow to one source address/port, installing the
/// pair itself as the capability requires.
#[derive(Debug)]
struct PinnedSnat {
    src: Ipv4Addr,
    sport: u16,
    foutput: usize,
    routput: usize,
}

impl FlowMapper for PinnedSnat {
    fn get_map(&self, proto: Proto, flow: &FlowId, rewriter: &mut Rewriter) -> Option<MapRef> {
        let out = FlowId::new(self.src, self.sport, flow.daddr(), flow.dport());
        let pair = MappingPair::new(*flow, out, None, None, self.foutput, self.routput);
        Some(rewriter.install(proto, pair))
    }
}

/// A mapper that refuses every flow.
#[derive(Debug)]
struct RefusingMapper;

impl FlowMapper for RefusingMapper {
    fn get_map(&self, _: Proto, _: &FlowId, _: &mut Rewriter) -> Option<MapRef> {
        None
    }
}

#[test]
#[traced_test]
fn mapper_delegation() {
    let mut mappers = MapperRegistry::new();
    mappers.insert(
        "pinned",
        Arc::new(PinnedSnat {
            src: addr_v4("7.7.7.7"),
            sport: 4000,
            foutput: 1,
            routput: 0,
        }),
    );
    let spec = InputSpec::parse("pinned", &PatternRegistry::new(), &mappers)
        .expect("mapper spec parses");
    let mut rw = Rewriter::new(vec![spec], 2).expect("rewriter builds");

    let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"syn");
    let emit = rw.push(0, packet).expect("mapper supplies a mapping");
    assert_eq!(emit.output, 1);
    assert_eq!(
        flow_of(&emit.packet),
        FlowId::new(addr_v4("7.7.7.7"), 4000, addr_v4("8.8.8.8"), 80)
    );
    assert_checksums_valid(&emit.packet);

    // The mapper installed the pair, so the reply hits the table directly.
    let reply = build_test_tcp_packet("8.8.8.8", "7.7.7.7", 80, 4000, b"syn-ack");
    let emit = rw.push(0, reply).expect("reply found in table");
    assert_eq!(emit.output, 0);
    assert_eq!(
        flow_of(&emit.packet),
        FlowId::new(addr_v4("8.8.8.8"), 80, addr_v4("10.0.0.5"), 5000)
    );
    assert_checksums_valid(&emit.packet);
}

#[test]
fn refusing_mapper_drops() {
    let mut mappers = MapperRegistry::new();
    mappers.insert("refuse", Arc::new(RefusingMapper));
    let spec = InputSpec::parse("refuse", &PatternRegistry::new(), &mappers)
        .expect("mapper spec parses");
    let mut rw = Rewriter::new(vec![spec], 1).expect("rewriter builds");

    let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"syn");
    assert!(rw.push(0, packet).is_none());
    assert_eq!(rw.mapping_count(Proto::Tcp), 0);
}

#[test]
fn dump_formats() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-65535 - - 0 1"], 2);
    assert_eq!(rw.dump_patterns(), "1.2.3.4:1024-65535 / -:-\n");

    let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"syn");
    rw.push(0, packet).expect("mapping created");

    let dump = rw.dump_mappings();
    assert!(dump.starts_with("TCP:\n"), "dump was: {dump}");
    assert!(
        dump.contains("10.0.0.5:5000 -> 8.8.8.8:80 => 1.2.3.4:1024 -> 8.8.8.8:80 [0]"),
        "dump was: {dump}"
    );
    assert!(!dump.contains("UDP:"), "empty groups are omitted: {dump}");
}

#[test]
fn clear_empties_everything_and_frees_ports() {
    let mut rw = rewriter(&["pattern 1.2.3.4 1024-1024 - - 0 1"], 2);
    let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, b"x");
    rw.push(0, packet).expect("mapping created");
    assert_eq!(rw.mapping_count(Proto::Tcp), 2);

    rw.clear();
    assert_eq!(rw.mapping_count(Proto::Tcp), 0);
    assert_eq!(rw.dump_mappings(), "");

    // The pattern's ring was unlinked, so the port binds again.
    let packet = build_test_tcp_packet("10.0.0.6", "8.8.8.8", 5000, 80, b"x");
    let emit = rw.push(0, packet).expect("port rebinds after clear");
    assert_eq!(flow_of(&emit.packet).sport(), 1024);
}
