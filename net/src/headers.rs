// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The parsed header chain of an IPv4 TCP or UDP packet.

use crate::ipv4::{Ipv4, Ipv4Error};
use crate::parse::{DeParse, DeParseError, Parse, ParseError};
use crate::tcp::{Tcp, TcpError};
use crate::udp::{Udp, UdpParseError};
use etherparse::IpNumber;
use std::num::NonZero;

/// A transport header (only TCP and UDP are representable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// A TCP header.
    Tcp(Tcp),
    /// A UDP header.
    Udp(Udp),
}

impl Transport {
    /// The source port, regardless of transport.
    #[must_use]
    pub fn source_port(&self) -> u16 {
        match self {
            Transport::Tcp(tcp) => tcp.source().as_u16(),
            Transport::Udp(udp) => udp.source().as_u16(),
        }
    }

    /// The destination port, regardless of transport.
    #[must_use]
    pub fn destination_port(&self) -> u16 {
        match self {
            Transport::Tcp(tcp) => tcp.destination().as_u16(),
            Transport::Udp(udp) => udp.destination().as_u16(),
        }
    }
}

/// The parsed headers of an IPv4 TCP or UDP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    ipv4: Ipv4,
    transport: Transport,
}

impl Headers {
    /// The IPv4 header.
    #[must_use]
    pub fn ipv4(&self) -> &Ipv4 {
        &self.ipv4
    }

    /// The IPv4 header, mutably.
    pub fn ipv4_mut(&mut self) -> &mut Ipv4 {
        &mut self.ipv4
    }

    /// The transport header.
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The transport header, mutably.
    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }
}

/// Errors which may occur when parsing a packet's header chain.
#[derive(Debug, thiserror::Error)]
pub enum HeadersError {
    /// The IPv4 header is invalid.
    #[error("bad ipv4 header: {0}")]
    Ipv4(Ipv4Error),
    /// The packet is neither TCP nor UDP.
    #[error("unsupported transport protocol: {0:?}")]
    UnsupportedProtocol(IpNumber),
    /// The TCP header is invalid.
    #[error("bad tcp header: {0}")]
    Tcp(TcpError),
    /// The UDP header is invalid.
    #[error("bad udp header: {0}")]
    Udp(UdpParseError),
}

fn lift<T: core::error::Error>(
    e: ParseError<T>,
    f: impl FnOnce(T) -> HeadersError,
) -> ParseError<HeadersError> {
    match e {
        ParseError::Length(l) => ParseError::Length(l),
        ParseError::Invalid(inner) => ParseError::Invalid(f(inner)),
    }
}

impl Parse for Headers {
    type Error = HeadersError;

    fn parse(buf: &[u8]) -> Result<(Self, NonZero<usize>), ParseError<Self::Error>> {
        let (ipv4, consumed) = Ipv4::parse(buf).map_err(|e| lift(e, HeadersError::Ipv4))?;
        let rest = &buf[consumed.get()..];
        let (transport, transport_consumed) = match ipv4.protocol() {
            IpNumber::TCP => {
                let (tcp, n) = Tcp::parse(rest).map_err(|e| lift(e, HeadersError::Tcp))?;
                (Transport::Tcp(tcp), n)
            }
            IpNumber::UDP => {
                let (udp, n) = Udp::parse(rest).map_err(|e| lift(e, HeadersError::Udp))?;
                (Transport::Udp(udp), n)
            }
            other => return Err(ParseError::Invalid(HeadersError::UnsupportedProtocol(other))),
        };
        let total = consumed
            .checked_add(transport_consumed.get())
            .unwrap_or_else(|| unreachable!());
        Ok((Self { ipv4, transport }, total))
    }
}

impl DeParse for Headers {
    type Error = ();

    fn size(&self) -> NonZero<usize> {
        let transport = match &self.transport {
            Transport::Tcp(tcp) => tcp.size(),
            Transport::Udp(udp) => udp.size(),
        };
        self.ipv4
            .size()
            .checked_add(transport.get())
            .unwrap_or_else(|| unreachable!())
    }

    fn deparse(&self, buf: &mut [u8]) -> Result<NonZero<usize>, DeParseError<Self::Error>> {
        let ip_len = self.ipv4.deparse(buf)?;
        let rest = &mut buf[ip_len.get()..];
        let transport_len = match &self.transport {
            Transport::Tcp(tcp) => tcp.deparse(rest)?,
            Transport::Udp(udp) => udp.deparse(rest)?,
        };
        ip_len
            .checked_add(transport_len.get())
            .ok_or_else(|| unreachable!())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
#[cfg(test)]
mod test {
    use super::{Headers, HeadersError, Transport};
    use crate::parse::{Parse, ParseError};
    use etherparse::PacketBuilder;

    #[test]
    fn parse_udp_chain() {
        let builder = PacketBuilder::ipv4([1, 2, 3, 4], [5, 6, 7, 8], 64).udp(5000, 53);
        let mut buf = Vec::with_capacity(builder.size(4));
        builder.write(&mut buf, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

        let (headers, consumed) = Headers::parse(&buf).unwrap();
        assert_eq!(consumed.get(), 28);
        assert_eq!(headers.ipv4().source().octets(), [1, 2, 3, 4]);
        assert!(matches!(headers.transport(), Transport::Udp(_)));
        assert_eq!(headers.transport().source_port(), 5000);
        assert_eq!(headers.transport().destination_port(), 53);
    }

    #[test]
    fn reject_non_tcp_udp() {
        let builder = PacketBuilder::ipv4([1, 2, 3, 4], [5, 6, 7, 8], 64)
            .icmpv4_echo_request(1, 1);
        let mut buf = Vec::with_capacity(builder.size(0));
        builder.write(&mut buf, &[]).unwrap();

        assert!(matches!(
            Headers::parse(&buf),
            Err(ParseError::Invalid(HeadersError::UnsupportedProtocol(_)))
        ));
    }
}
