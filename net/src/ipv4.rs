// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IPv4 header type and manipulation.

use crate::parse::{DeParse, DeParseError, LengthError, Parse, ParseError};
use etherparse::{IpNumber, Ipv4Header};
use std::net::Ipv4Addr;
use std::num::NonZero;

/// An IPv4 header.
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4(Ipv4Header);

impl Ipv4 {
    /// The minimum length of an IPv4 header (i.e., a header with no options).
    #[allow(clippy::unwrap_used)] // const-eval and trivially safe
    pub const MIN_LEN: NonZero<usize> = NonZero::new(20).unwrap();

    /// The maximum length of an IPv4 header (i.e., a header with full options).
    #[allow(clippy::unwrap_used)] // const-eval and trivially safe
    pub const MAX_LEN: NonZero<usize> = NonZero::new(60).unwrap();

    /// Get the source ip address of the header.
    #[must_use]
    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.0.source)
    }

    /// Get the destination ip address of the header.
    #[must_use]
    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.0.destination)
    }

    /// Get the next layer protocol which follows this header.
    #[must_use]
    pub fn protocol(&self) -> IpNumber {
        self.0.protocol
    }

    /// Length of the header (includes options) in bytes.
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.0.header_len()
    }

    /// Get the header checksum. No attempt is made to ensure it is correct.
    #[must_use]
    pub fn checksum(&self) -> u16 {
        self.0.header_checksum
    }

    /// Set the source ip of the header.
    pub fn set_source(&mut self, source: Ipv4Addr) -> &mut Self {
        self.0.source = source.octets();
        self
    }

    /// Set the destination ip address for this header.
    pub fn set_destination(&mut self, dest: Ipv4Addr) -> &mut Self {
        self.0.destination = dest.octets();
        self
    }

    /// Set the header checksum. No attempt is made to ensure it is correct.
    pub fn set_checksum(&mut self, checksum: u16) -> &mut Self {
        self.0.header_checksum = checksum;
        self
    }

    /// Recompute the header checksum from the current header contents.
    pub fn update_checksum(&mut self) -> &mut Self {
        self.0.header_checksum = self.0.calc_header_checksum();
        self
    }

    /// Access the wrapped [`Ipv4Header`] (for checksum validation in tests
    /// and builders).
    #[must_use]
    pub fn inner(&self) -> &Ipv4Header {
        &self.0
    }
}

/// Errors which can occur when parsing arbitrary bytes into an [`Ipv4`]
/// header.
#[derive(thiserror::Error, Debug)]
pub enum Ipv4Error {
    /// The bytes do not form a valid IPv4 header.
    #[error(transparent)]
    Invalid(etherparse::err::ipv4::HeaderError),
}

impl Parse for Ipv4 {
    type Error = Ipv4Error;

    fn parse(buf: &[u8]) -> Result<(Self, NonZero<usize>), ParseError<Self::Error>> {
        use etherparse::err::ipv4::HeaderSliceError;
        let (inner, rest) = Ipv4Header::from_slice(buf).map_err(|e| match e {
            HeaderSliceError::Len(len) => ParseError::Length(LengthError {
                expected: NonZero::new(len.required_len).unwrap_or_else(|| unreachable!()),
                actual: buf.len(),
            }),
            HeaderSliceError::Content(content) => ParseError::Invalid(Ipv4Error::Invalid(content)),
        })?;
        let consumed = NonZero::new(buf.len() - rest.len()).ok_or_else(|| unreachable!())?;
        Ok((Self(inner), consumed))
    }
}

impl DeParse for Ipv4 {
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
