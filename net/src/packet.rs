// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A packet: an owned raw buffer plus its parsed header chain.

pub mod test_utils;

use crate::headers::{Headers, HeadersError};
use crate::parse::{DeParse, Parse, ParseError};
use std::fmt::{Display, Formatter};
use tracing::debug;

/// An IPv4 TCP or UDP packet.
///
/// The headers are parsed once at construction; rewrites mutate the parsed
/// headers and [`Packet::serialize`] writes them back over the original
/// bytes. Rewrites never change header sizes (only addresses, ports, and
/// checksums), so the payload bytes are untouched throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    headers: Headers,
    headers_len: usize,
    buf: Vec<u8>,
}

/// The buffer handed to [`Packet::new`] did not parse as an IPv4 TCP or UDP
/// packet.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct InvalidPacket {
    /// Why parsing failed.
    pub error: ParseError<HeadersError>,
    /// The buffer, returned to the caller.
    pub buf: Vec<u8>,
}

impl Packet {
    /// Parse `buf` into a packet.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPacket`] (carrying the buffer back) if the bytes do
    /// not form an IPv4 TCP or UDP packet.
    pub fn new(buf: Vec<u8>) -> Result<Packet, InvalidPacket> {
        match Headers::parse(&buf) {
            Ok((headers, consumed)) => Ok(Packet {
                headers,
                headers_len: consumed.get(),
                buf,
            }),
            Err(error) => {
                debug!("packet parse failed: {error}");
                Err(InvalidPacket { error, buf })
            }
        }
    }

    /// The parsed headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The parsed headers, mutably.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The payload bytes following the transport header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.headers_len..]
    }

    /// Write the (possibly rewritten) headers back over the buffer and return
    /// it.
    #[must_use]
    pub fn serialize(mut self) -> Vec<u8> {
        debug_assert_eq!(
            self.headers.size().get(),
            self.headers_len,
            "rewrites must not change header sizes"
        );
        // Infallible: the buffer held these headers at parse time and their
        // sizes are unchanged.
        if self.headers.deparse(&mut self.buf).is_err() {
            unreachable!()
        }
        self.buf
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let ip = self.headers.ipv4();
        write!(
            f,
            "{src}:{sport} -> {dst}:{dport} ({len} payload bytes)",
            src = ip.source(),
            sport = self.headers.transport().source_port(),
            dst = ip.destination(),
            dport = self.headers.transport().destination_port(),
            len = self.payload().len(),
        )
    }
}
