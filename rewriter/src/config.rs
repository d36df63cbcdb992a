// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Input-spec configuration language and the shared registries.
//!
//! Each input port of a rewriter carries one [`InputSpec`], written as a
//! space-separated word list:
//!
//! ```text
//! nochange [OUTPUT]
//! drop
//! pattern SADDR SPORT DADDR DPORT FOUTPUT ROUTPUT
//! pattern NAME FOUTPUT ROUTPUT
//! MAPPERNAME
//! ```
//!
//! `SADDR`, `DADDR`, and `DPORT` accept `-` for "preserve"; `SPORT` accepts
//! `-`, a single port, or `LO-HI`. Named patterns resolve through a
//! [`PatternRegistry`]; a bare word that is not a known keyword resolves
//! through a [`MapperRegistry`].

use crate::mapper::FlowMapper;
use crate::pattern::{Pattern, PatternError, PortRange};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use std::num::NonZero;
use std::sync::Arc;

/// The per-input policy for packets that do not match any existing mapping.
#[derive(Clone)]
pub enum InputSpec {
    /// Forward packets unchanged to `output` when no mapping exists.
    NoChange {
        /// The output port unchanged packets take.
        output: usize,
    },
    /// Drop packets with no existing mapping.
    Drop,
    /// Bind a new mapping pair from `pattern` on a miss.
    Pattern {
        /// The pattern allocating the rewrite.
        pattern: Arc<Pattern>,
        /// Output port for forward traffic.
        foutput: usize,
        /// Output port for reverse traffic.
        routput: usize,
    },
    /// Delegate the miss to an external mapper.
    Mapper {
        /// The mapper supplying mappings.
        mapper: Arc<dyn FlowMapper>,
    },
}

impl Debug for InputSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSpec::NoChange { output } => f.debug_struct("NoChange").field("output", output).finish(),
            InputSpec::Drop => f.write_str("Drop"),
            InputSpec::Pattern {
                pattern,
                foutput,
                routput,
            } => f
                .debug_struct("Pattern")
                .field("pattern", &format_args!("{pattern}"))
                .field("foutput", foutput)
                .field("routput", routput)
                .finish(),
            InputSpec::Mapper { .. } => f.write_str("Mapper"),
        }
    }
}

/// Errors surfaced while parsing or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An input spec was empty.
    #[error("input spec is empty")]
    EmptySpec,
    /// The first word is neither a keyword nor a known mapper.
    #[error("unknown input spec kind `{0}`")]
    UnknownKind(String),
    /// Trailing words after a complete spec.
    #[error("unexpected trailing words in `{0}` spec")]
    TrailingWords(String),
    /// A pattern spec had the wrong shape.
    #[error(
        "bad pattern spec: should be `NAME FOUTPUT ROUTPUT' or `SADDR SPORT DADDR DPORT FOUTPUT ROUTPUT'"
    )]
    BadPatternSpec,
    /// A word did not parse as an IPv4 address.
    #[error("bad address `{0}` in pattern spec")]
    BadAddress(String),
    /// A word did not parse as a port or port range.
    #[error("bad port `{0}`")]
    BadPort(String),
    /// A word did not parse as an output-port index.
    #[error("bad output `{0}`")]
    BadOutput(String),
    /// A port or port range failed validation.
    #[error("port(s) out of range: {0}")]
    PortOutOfRange(PatternError),
    /// A named pattern is not present in the registry.
    #[error("no pattern named `{0}`")]
    UnknownPattern(String),
    /// The registry already holds a pattern under this name.
    #[error("pattern `{0}` already registered")]
    DuplicatePattern(String),
    /// An output index is not within the rewriter's output range.
    #[error("output {output} out of range (rewriter has {noutputs} outputs)")]
    OutputOutOfRange {
        /// The offending output index.
        output: usize,
        /// The rewriter's output count.
        noutputs: usize,
    },
    /// Two configured patterns definitely collide.
    #[error("patterns definitely conflict: `{0}` and `{1}`")]
    ConflictingPatterns(String, String),
}

/// A shared registry of named patterns, handed to configuration explicitly.
#[derive(Debug, Default)]
pub struct PatternRegistry {
    patterns: HashMap<String, Arc<Pattern>>,
}

impl PatternRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern` under `name`.
    pub fn insert(&mut self, name: &str, pattern: Arc<Pattern>) -> Result<(), ConfigError> {
        if self.patterns.contains_key(name) {
            return Err(ConfigError::DuplicatePattern(name.to_string()));
        }
        self.patterns.insert(name.to_string(), pattern);
        Ok(())
    }

    /// Look up a pattern by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Pattern>> {
        self.patterns.get(name).cloned()
    }
}

/// A registry of named external mappers.
#[derive(Default)]
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn FlowMapper>>,
}

impl MapperRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mapper` under `name`. A later registration replaces an
    /// earlier one of the same name.
    pub fn insert(&mut self, name: &str, mapper: Arc<dyn FlowMapper>) {
        self.mappers.insert(name.to_string(), mapper);
    }

    /// Look up a mapper by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn FlowMapper>> {
        self.mappers.get(name).cloned()
    }
}

impl Debug for MapperRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperRegistry")
            .field("names", &self.mappers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn parse_addr(word: &str) -> Result<Option<Ipv4Addr>, ConfigError> {
    if word == "-" {
        return Ok(None);
    }
    word.parse()
        .map(Some)
        .map_err(|_| ConfigError::BadAddress(word.to_string()))
}

fn parse_sport(word: &str) -> Result<Option<PortRange>, ConfigError> {
    if word == "-" {
        return Ok(None);
    }
    let bad_port = || ConfigError::BadPort(word.to_string());
    let (lo, hi) = match word.split_once('-') {
        Some((lo, hi)) => (
            lo.parse().map_err(|_| bad_port())?,
            hi.parse().map_err(|_| bad_port())?,
        ),
        None => {
            let port = word.parse().map_err(|_| bad_port())?;
            (port, port)
        }
    };
    PortRange::new(lo, hi)
        .map(Some)
        .map_err(ConfigError::PortOutOfRange)
}

fn parse_dport(word: &str) -> Result<Option<NonZero<u16>>, ConfigError> {
    if word == "-" {
        return Ok(None);
    }
    let port: u16 = word
        .parse()
        .map_err(|_| ConfigError::BadPort(word.to_string()))?;
    NonZero::new(port)
        .map(Some)
        .ok_or(ConfigError::PortOutOfRange(PatternError::ZeroPort))
}

fn parse_output(word: &str) -> Result<usize, ConfigError> {
    word.parse()
        .map_err(|_| ConfigError::BadOutput(word.to_string()))
}

/// Parse an inline pattern definition: `SADDR SPORT DADDR DPORT`.
pub fn parse_pattern(words: &[&str]) -> Result<Pattern, ConfigError> {
    let [saddr, sport, daddr, dport] = words else {
        return Err(ConfigError::BadPatternSpec);
    };
    Ok(Pattern::new(
        parse_addr(saddr)?,
        parse_sport(sport)?,
        parse_addr(daddr)?,
        parse_dport(dport)?,
    ))
}

/// Parse a pattern spec carrying trailing forward/reverse output ports:
/// either `NAME FOUTPUT ROUTPUT` or `SADDR SPORT DADDR DPORT FOUTPUT
/// ROUTPUT`.
pub fn parse_pattern_with_ports(
    words: &[&str],
    patterns: &PatternRegistry,
) -> Result<(Arc<Pattern>, usize, usize), ConfigError> {
    let [rest @ .., foutput, routput] = words else {
        return Err(ConfigError::BadPatternSpec);
    };
    let foutput = parse_output(foutput)?;
    let routput = parse_output(routput)?;
    let pattern = match rest {
        [name] => patterns
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPattern((*name).to_string()))?,
        _ => Arc::new(parse_pattern(rest)?),
    };
    Ok((pattern, foutput, routput))
}

impl InputSpec {
    /// Parse one input spec, resolving names through the given registries.
    pub fn parse(
        spec: &str,
        patterns: &PatternRegistry,
        mappers: &MapperRegistry,
    ) -> Result<InputSpec, ConfigError> {
        let words: Vec<&str> = spec.split_whitespace().collect();
        let Some((&kind, rest)) = words.split_first() else {
            return Err(ConfigError::EmptySpec);
        };
        match kind {
            "nochange" => match rest {
                [] => Ok(InputSpec::NoChange { output: 0 }),
                [output] => Ok(InputSpec::NoChange {
                    output: parse_output(output)?,
                }),
                _ => Err(ConfigError::TrailingWords("nochange".to_string())),
            },
            "drop" => {
                if rest.is_empty() {
                    Ok(InputSpec::Drop)
                } else {
                    Err(ConfigError::TrailingWords("drop".to_string()))
                }
            }
            "pattern" => {
                let (pattern, foutput, routput) = parse_pattern_with_ports(rest, patterns)?;
                Ok(InputSpec::Pattern {
                    pattern,
                    foutput,
                    routput,
                })
            }
            name => {
                let mapper = mappers
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownKind(name.to_string()))?;
                if rest.is_empty() {
                    Ok(InputSpec::Mapper { mapper })
                } else {
                    Err(ConfigError::TrailingWords(name.to_string()))
                }
            }
        }
    }
}
