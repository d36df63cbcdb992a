// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! TCP header type and logic.

/// TCP port types.
pub mod port;

use crate::parse::{DeParse, DeParseError, LengthError, Parse, ParseError};
use crate::tcp::port::TcpPort;
use etherparse::TcpHeader;
use etherparse::err::tcp::{HeaderError, HeaderSliceError};
use std::num::NonZero;

/// A TCP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tcp(TcpHeader);

impl Tcp {
    /// The minimum length of a [`Tcp`] header.
    pub const MIN_LENGTH: usize = 20;

    /// The maximum length of a [`Tcp`] header (i.e., a header with full
    /// options).
    pub const MAX_LENGTH: usize = 60;

    /// Get the source port.
    #[must_use]
    pub fn source(&self) -> TcpPort {
        TcpPort::new_checked(self.0.source_port).unwrap_or_else(|_| unreachable!())
    }

    /// Set the source port.
    pub fn set_source(&mut self, port: TcpPort) -> &mut Self {
        self.0.source_port = port.into();
        self
    }

    /// Get the destination port.
    #[must_use]
    pub fn destination(&self) -> TcpPort {
        TcpPort::new_checked(self.0.destination_port).unwrap_or_else(|_| unreachable!())
    }

    /// Set the destination port.
    pub fn set_destination(&mut self, port: TcpPort) -> &mut Self {
        self.0.destination_port = port.into();
        self
    }

    /// Get the header length (includes options) in bytes.
    #[must_use]
    pub fn header_len(&self) -> NonZero<usize> {
        NonZero::new(self.0.header_len()).unwrap_or_else(|| unreachable!())
    }

    /// Get the checksum of the header. No attempt is made to ensure it is
    /// correct.
    #[must_use]
    pub const fn checksum(&self) -> u16 {
        self.0.checksum
    }

    /// Set the checksum.
    pub fn set_checksum(&mut self, checksum: u16) -> &mut Self {
        self.0.checksum = checksum;
        self
    }

    /// Access the wrapped [`TcpHeader`] (for checksum validation in tests and
    /// builders).
    #[must_use]
    pub fn inner(&self) -> &TcpHeader {
        &self.0
    }
}

/// Errors which can occur when attempting to parse arbitrary bytes into a
/// [`Tcp`] header.
#[derive(Debug, thiserror::Error)]
pub enum TcpError {
    /// Zero is not legal as a source port.
    #[error("zero source port")]
    ZeroSourcePort,
    /// Zero is not legal as a destination port.
    #[error("zero dest port")]
    ZeroDestPort,
    /// Valid tcp headers have data offsets at least large enough to include
    /// the header itself.
    #[error("data offset too small: {0}")]
    DataOffsetTooSmall(u8),
}

impl Parse for Tcp {
    type Error = TcpError;

    fn parse(buf: &[u8]) -> Result<(Self, NonZero<usize>), ParseError<Self::Error>> {
        let (inner, rest) = TcpHeader::from_slice(buf).map_err(|e| match e {
            HeaderSliceError::Len(len) => ParseError::Length(LengthError {
                expected: NonZero::new(len.required_len).unwrap_or_else(|| unreachable!()),
                actual: buf.len(),
            }),
            HeaderSliceError::Content(content) => match content {
                HeaderError::DataOffsetTooSmall { data_offset } => {
                    ParseError::Invalid(TcpError::DataOffsetTooSmall(data_offset))
                }
            },
        })?;
        let consumed = NonZero::new(buf.len() - rest.len()).ok_or_else(|| unreachable!())?;
        if inner.source_port == 0 {
            return Err(ParseError::Invalid(TcpError::ZeroSourcePort));
        }
        if inner.destination_port == 0 {
            return Err(ParseError::Invalid(TcpError::ZeroDestPort));
        }
        Ok((Self(inner), consumed))
    }
}

impl DeParse for Tcp {
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
