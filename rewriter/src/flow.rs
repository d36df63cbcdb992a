// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow identity: the rewriter's view of a packet's 5-tuple.

use net::headers::{Headers, Transport};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// The transport protocol of a flow. Selects which mapping table a flow lives
/// in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl Display for Proto {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Proto::Tcp => write!(f, "TCP"),
            Proto::Udp => write!(f, "UDP"),
        }
    }
}

/// The address/port quadruple identifying one direction of a flow.
///
/// Equality and hashing are bitwise over all four fields; the protocol is
/// carried separately (see [`Proto`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    saddr: Ipv4Addr,
    sport: u16,
    daddr: Ipv4Addr,
    dport: u16,
}

impl FlowId {
    /// Create a flow id from its four fields.
    #[must_use]
    pub fn new(saddr: Ipv4Addr, sport: u16, daddr: Ipv4Addr, dport: u16) -> Self {
        Self {
            saddr,
            sport,
            daddr,
            dport,
        }
    }

    /// Extract the protocol and flow id of a parsed packet.
    #[must_use]
    pub fn of_packet(headers: &Headers) -> (Proto, FlowId) {
        let proto = match headers.transport() {
            Transport::Tcp(_) => Proto::Tcp,
            Transport::Udp(_) => Proto::Udp,
        };
        let flow = FlowId::new(
            headers.ipv4().source(),
            headers.transport().source_port(),
            headers.ipv4().destination(),
            headers.transport().destination_port(),
        );
        (proto, flow)
    }

    /// The source address.
    #[must_use]
    pub fn saddr(&self) -> Ipv4Addr {
        self.saddr
    }

    /// The source port.
    #[must_use]
    pub fn sport(&self) -> u16 {
        self.sport
    }

    /// The destination address.
    #[must_use]
    pub fn daddr(&self) -> Ipv4Addr {
        self.daddr
    }

    /// The destination port.
    #[must_use]
    pub fn dport(&self) -> u16 {
        self.dport
    }

    /// The flow id with source and destination swapped.
    #[must_use]
    pub fn reverse(&self) -> FlowId {
        FlowId {
            saddr: self.daddr,
            sport: self.dport,
            daddr: self.saddr,
            dport: self.sport,
        }
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.saddr, self.sport, self.daddr, self.dport
        )
    }
}

#[cfg(test)]
mod contract {
    use super::FlowId;
    use bolero::{Driver, TypeGenerator};
    use std::net::Ipv4Addr;

    impl TypeGenerator for FlowId {
        fn generate<D: Driver>(driver: &mut D) -> Option<Self> {
            Some(FlowId::new(
                Ipv4Addr::from(driver.produce::<u32>()?),
                driver.produce()?,
                Ipv4Addr::from(driver.produce::<u32>()?),
                driver.produce()?,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FlowId, Proto};
    use net::packet::test_utils::{addr_v4, build_test_tcp_packet, build_test_udp_packet};

    #[test]
    fn extraction() {
        let packet = build_test_udp_packet("1.2.3.4", "5.6.7.8", 9998, 443, &[]);
        let (proto, flow) = FlowId::of_packet(packet.headers());
        assert_eq!(proto, Proto::Udp);
        assert_eq!(
            flow,
            FlowId::new(addr_v4("1.2.3.4"), 9998, addr_v4("5.6.7.8"), 443)
        );

        let packet = build_test_tcp_packet("10.0.0.5", "8.8.8.8", 5000, 80, &[]);
        let (proto, flow) = FlowId::of_packet(packet.headers());
        assert_eq!(proto, Proto::Tcp);
        assert_eq!(
            flow,
            FlowId::new(addr_v4("10.0.0.5"), 5000, addr_v4("8.8.8.8"), 80)
        );
    }

    #[test]
    fn reverse_is_involutive() {
        bolero::check!().with_type::<FlowId>().for_each(|flow| {
            let reversed = flow.reverse();
            assert_eq!(reversed.saddr(), flow.daddr());
            assert_eq!(reversed.sport(), flow.dport());
            assert_eq!(reversed.daddr(), flow.saddr());
            assert_eq!(reversed.dport(), flow.sport());
            assert_eq!(reversed.reverse(), *flow);
        });
    }
}
