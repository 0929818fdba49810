// Copyright (C) 2022-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tracing-gelf.
//
// tracing-gelf is free software: you can redistribute it and/or modify it under the terms of the
// GNU General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tracing-gelf is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tracing-gelf.  If
// not, see <http://www.gnu.org/licenses/>.

//! [tracing-gelf](crate) errors

use backtrace::Backtrace;

/// [tracing-gelf](crate) error type
///
/// [tracing-gelf](crate) eschews libraries like [thiserror], [anyhow] & [Snafu] in favor of
/// a straightforward enumeration with a few match arms chosen on the basis what the caller will
/// need to respond.
///
/// Broadly, the variants fall into four groups:
///
/// - protocol errors ([`UnknownMagic`], [`BadChunkHeader`], [`TooManyChunks`], [`Decompress`],
///   [`Json`] & friends): fatal to the one message being processed, never to the transport or
///   listener that was processing it
/// - transport errors ([`Transport`], [`PartialWrite`]): socket or TLS I/O failures
/// - exhaustion ([`ReconnectExhausted`], [`Closed`]): the streaming transport gave up; build a
///   new one
/// - collaborator failures ([`NoHostname`])
///
/// [thiserror]: https://docs.rs/thiserror
/// [anyhow]: https://docs.rs/anyhow
/// [Snafu]: https://docs.rs/snafu/latest/snafu
/// [`UnknownMagic`]: Error::UnknownMagic
/// [`BadChunkHeader`]: Error::BadChunkHeader
/// [`TooManyChunks`]: Error::TooManyChunks
/// [`Decompress`]: Error::Decompress
/// [`Json`]: Error::Json
/// [`Transport`]: Error::Transport
/// [`PartialWrite`]: Error::PartialWrite
/// [`ReconnectExhausted`]: Error::ReconnectExhausted
/// [`Closed`]: Error::Closed
/// [`NoHostname`]: Error::NoHostname
#[non_exhaustive]
pub enum Error {
    /// The leading bytes matched neither the chunk magic nor a known compression container
    UnknownMagic { head: Vec<u8>, back: Backtrace },
    /// A chunk header failed validation
    BadChunkHeader { reason: String, back: Backtrace },
    /// A payload would need more chunks than the protocol allows
    TooManyChunks {
        count: usize,
        max: usize,
        back: Backtrace,
    },
    /// The configured chunk size can't hold a chunk header plus at least one byte of payload
    BadChunkSize { size: usize, back: Backtrace },
    /// Failed to inflate (or deflate) a payload
    Decompress {
        source: std::io::Error,
        back: Backtrace,
    },
    /// Failed to serialize or deserialize the GELF JSON document
    Json {
        source: serde_json::Error,
        back: Backtrace,
    },
    /// The JSON document was well-formed, but not a GELF message
    BadMessage { reason: String, back: Backtrace },
    /// An additional field collided with a reserved GELF field name
    ReservedField { name: String, back: Backtrace },
    /// An additional field name contained something other than word characters, '.' & '-'
    BadFieldName { name: String, back: Backtrace },
    /// An additional field had a value other than a string, number or boolean
    BadFieldValue { name: String, back: Backtrace },
    /// Attempted to build a message with no text at all
    EmptyMessage { back: Backtrace },
    /// Failed to fetch hostname
    NoHostname {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        back: Backtrace,
    },
    /// General transport layer error
    Transport {
        source: std::io::Error,
        back: Backtrace,
    },
    /// The socket accepted fewer bytes than we handed it
    PartialWrite {
        written: usize,
        total: usize,
        back: Backtrace,
    },
    /// The streaming transport used up its reconnect budget
    ReconnectExhausted {
        attempts: usize,
        source: Option<std::io::Error>,
        back: Backtrace,
    },
    /// The transport has been closed (or has failed) & will not be revived
    Closed { back: Backtrace },
}

impl Error {
    pub(crate) fn transport(source: std::io::Error) -> Error {
        Error::Transport {
            source,
            back: Backtrace::new(),
        }
    }
    pub(crate) fn decompress(source: std::io::Error) -> Error {
        Error::Decompress {
            source,
            back: Backtrace::new(),
        }
    }
    pub(crate) fn bad_chunk_header(reason: impl Into<String>) -> Error {
        Error::BadChunkHeader {
            reason: reason.into(),
            back: Backtrace::new(),
        }
    }
    /// True if this error concerns the contents of one message, rather than the transport that
    /// carried it.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::UnknownMagic { .. }
                | Error::BadChunkHeader { .. }
                | Error::TooManyChunks { .. }
                | Error::Decompress { .. }
                | Error::Json { .. }
                | Error::BadMessage { .. }
        )
    }
}

impl std::convert::From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json {
            source: err,
            back: Backtrace::new(),
        }
    }
}

impl std::fmt::Display for Error {
    // `Error` is non-exhaustive so that adding variants won't be a breaking change to our
    // callers. That means the compiler won't catch us if we miss a variant here, so we
    // always include a `_` arm.
    #[allow(unreachable_patterns)]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::UnknownMagic { head, .. } => {
                write!(f, "Unrecognized container; leading bytes were {:02x?}", head)
            }
            Error::BadChunkHeader { reason, .. } => write!(f, "Malformed chunk header: {}", reason),
            Error::TooManyChunks { count, max, .. } => write!(
                f,
                "Payload would require {} chunks, but at most {} are allowed",
                count, max
            ),
            Error::BadChunkSize { size, .. } => write!(
                f,
                "A chunk size of {} bytes leaves no room for payload after the chunk header",
                size
            ),
            Error::Decompress { source, .. } => write!(f, "While (de)compressing, got {}", source),
            Error::Json { source, .. } => write!(f, "While (de)serializing JSON, got {}", source),
            Error::BadMessage { reason, .. } => write!(f, "Not a GELF message: {}", reason),
            Error::ReservedField { name, .. } => write!(
                f,
                "'{}' is a reserved GELF field & may not be used as an additional field",
                name
            ),
            Error::BadFieldName { name, .. } => {
                write!(f, "'{}' is not a legal GELF additional field name", name)
            }
            Error::BadFieldValue { name, .. } => write!(
                f,
                "Additional field '{}' must be a string, number or boolean",
                name
            ),
            Error::EmptyMessage { .. } => write!(f, "A GELF message needs a short message"),
            Error::NoHostname { source, .. } => {
                write!(f, "Failed to determine this host's name: {}", source)
            }
            Error::Transport { source, .. } => write!(f, "Transport error: {}", source),
            Error::PartialWrite { written, total, .. } => {
                write!(f, "Bad write ({}/{} bytes)", written, total)
            }
            Error::ReconnectExhausted {
                attempts, source, ..
            } => match source {
                Some(err) => write!(
                    f,
                    "Gave up after {} reconnect attempts; last error was {}",
                    attempts, err
                ),
                None => write!(f, "Gave up after {} reconnect attempts", attempts),
            },
            Error::Closed { .. } => write!(f, "The transport has been closed"),
            _ => write!(f, "Other tracing-gelf error"),
        }
    }
}

impl std::fmt::Debug for Error {
    #[allow(unreachable_patterns)]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::UnknownMagic { back, .. }
            | Error::BadChunkHeader { back, .. }
            | Error::TooManyChunks { back, .. }
            | Error::BadChunkSize { back, .. }
            | Error::Decompress { back, .. }
            | Error::Json { back, .. }
            | Error::BadMessage { back, .. }
            | Error::ReservedField { back, .. }
            | Error::BadFieldName { back, .. }
            | Error::BadFieldValue { back, .. }
            | Error::EmptyMessage { back }
            | Error::NoHostname { back, .. }
            | Error::Transport { back, .. }
            | Error::PartialWrite { back, .. }
            | Error::ReconnectExhausted { back, .. }
            | Error::Closed { back } => write!(f, "{}\n{:#?}", self, back),
            err => write!(f, "tracing-gelf error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decompress { source, .. } => Some(source),
            Error::Json { source, .. } => Some(source),
            Error::Transport { source, .. } => Some(source),
            Error::ReconnectExhausted {
                source: Some(err), ..
            } => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
