// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! UDP header type and logic.

/// UDP port types.
pub mod port;

use crate::parse::{DeParse, DeParseError, LengthError, Parse, ParseError};
use crate::udp::port::UdpPort;
use etherparse::UdpHeader;
use std::num::NonZero;

/// A UDP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Udp(UdpHeader);

impl Udp {
    /// The length of a UDP header.
    #[allow(clippy::unwrap_used)] // safe due to const-eval
    pub const MIN_LENGTH: NonZero<usize> = NonZero::new(8).unwrap();

    /// Get the header's source port.
    #[must_use]
    pub fn source(&self) -> UdpPort {
        UdpPort::new_checked(self.0.source_port).unwrap_or_else(|_| unreachable!())
    }

    /// Set the source port.
    pub fn set_source(&mut self, port: UdpPort) -> &mut Self {
        self.0.source_port = port.into();
        self
    }

    /// Get the header's dest port.
    #[must_use]
    pub fn destination(&self) -> UdpPort {
        UdpPort::new_checked(self.0.destination_port).unwrap_or_else(|_| unreachable!())
    }

    /// Set the destination port.
    pub fn set_destination(&mut self, port: UdpPort) -> &mut Self {
        self.0.destination_port = port.into();
        self
    }

    /// Get the header's checksum. A zero checksum means "no checksum" on the
    /// wire; no attempt is made to ensure a non-zero value is correct.
    #[must_use]
    pub fn checksum(&self) -> u16 {
        self.0.checksum
    }

    /// Set the udp checksum. No attempt is made to ensure the checksum is
    /// correct.
    pub fn set_checksum(&mut self, checksum: u16) -> &mut Self {
        self.0.checksum = checksum;
        self
    }

    /// Access the wrapped [`UdpHeader`] (for checksum validation in tests and
    /// builders).
    #[must_use]
    pub fn inner(&self) -> &UdpHeader {
        &self.0
    }
}

/// Errors which may occur when parsing a UDP header.
#[derive(Debug, thiserror::Error)]
pub enum UdpParseError {
    /// Zero is not a legal udp port.
    #[error("zero source port")]
    ZeroSourcePort,
    /// Zero is not a legal udp port.
    #[error("zero destination port")]
    ZeroDestinationPort,
}

impl Parse for Udp {
    type Error = UdpParseError;

    fn parse(buf: &[u8]) -> Result<(Self, NonZero<usize>), ParseError<Self::Error>> {
        let (inner, rest) = UdpHeader::from_slice(buf).map_err(|e| {
            let expected = NonZero::new(e.required_len).unwrap_or_else(|| unreachable!());
            ParseError::Length(LengthError {
                expected,
                actual: buf.len(),
            })
        })?;
        let consumed = NonZero::new(buf.len() - rest.len()).ok_or_else(|| unreachable!())?;
        if inner.source_port == 0 {
            return Err(ParseError::Invalid(UdpParseError::ZeroSourcePort));
        }
        if inner.destination_port == 0 {
            return Err(ParseError::Invalid(UdpParseError::ZeroDestinationPort));
        }
        Ok((Self(inner), consumed))
    }
}

impl DeParse for Udp {
    type Error = ();

    fn size(&self) -> NonZero<usize> {
        NonZero::new(self.0.header_len()).unwrap_or_else(|| unreachable!())
    }

    fn deparse(&self, buf: &mut [u8]) -> Result<NonZero<usize>, DeParseError<Self::Error>> {
        let len = buf.len();
        if len < self.size().get() {
            return Err(DeParseError::Length(LengthError {
                expected: self.size(),
                actual: len,
            }));
        }
        buf[..self.size().get()].copy_from_slice(&self.0.to_bytes());
        Ok(self.size())
    }
}
