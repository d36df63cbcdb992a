// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packet parsing traits.

use std::num::NonZero;

/// Parse a header from the front of a buffer.
pub trait Parse: Sized {
    /// Error describing why the buffer does not hold a valid header.
    type Error: core::error::Error;

    /// Parse from a buffer, returning the value and the number of bytes
    /// consumed.
    ///
    /// # Errors
    ///
    /// Returns an error in the event that parsing fails.
    fn parse(buf: &[u8]) -> Result<(Self, NonZero<usize>), ParseError<Self::Error>>;
}

/// Write a header back to a buffer.
pub trait DeParse {
    /// Error for implementation-specific serialization failures.
    type Error;

    /// The number of bytes this header occupies on the wire.
    fn size(&self) -> NonZero<usize>;

    /// Write the header to the front of `buf`, returning the number of bytes
    /// written.
    ///
    /// # Errors
    ///
    /// Will return an error if there is not enough space in the buffer.
    fn deparse(&self, buf: &mut [u8]) -> Result<NonZero<usize>, DeParseError<Self::Error>>;
}

/// A buffer was too short to hold the value being parsed or written.
#[derive(thiserror::Error, Debug)]
#[error("expected at least {expected} bytes, got {actual}")]
pub struct LengthError {
    /// Bytes required.
    pub expected: NonZero<usize>,
    /// Bytes available.
    pub actual: usize,
}

/// Errors which may occur while parsing.
#[derive(thiserror::Error, Debug)]
pub enum ParseError<E: core::error::Error> {
    /// Buffer too short.
    #[error(transparent)]
    Length(LengthError),
    /// The bytes do not form a valid header.
    #[error(transparent)]
    Invalid(E),
}

/// Errors which may occur while serializing.
#[derive(thiserror::Error, Debug)]
pub enum DeParseError<E> {
    /// Buffer too short.
    #[error(transparent)]
    Length(LengthError),
    /// Implementation-specific failure.
    #[error("serialization failed")]
    Invalid(E),
}
