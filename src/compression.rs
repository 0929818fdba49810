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

//! Payload compression.
//!
//! GELF payloads are gzip- or zlib-compressed, and nothing on the wire says which: the receiver
//! has to sniff the leading bytes. gzip has a genuine two-byte magic number (`1f 8b`). zlib does
//! not; its first two bytes (CMF & FLG) are instead constructed so that, read as a big-endian
//! `u16`, they are a multiple of 31. We check for gzip first, then apply the zlib checksum test.
//!
//! The chunk magic (`1e 0f`, see [`chunk`](crate::chunk)) is 7695, which is 7 mod 31, and so can
//! never be mistaken for a zlib header; nor is it the gzip magic.

use crate::error::{Error, Result};

use backtrace::Backtrace;
use flate2::{
    bufread::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
};

use std::io::{BufRead, Read, Write};

/// gzip magic number
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Supported compression containers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    Gzip,
    Zlib,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zlib => write!(f, "zlib"),
        }
    }
}

impl Compression {
    /// Identify the compression container from its leading bytes, if possible.
    pub fn detect(buf: &[u8]) -> Option<Compression> {
        match buf {
            [a, b, ..] if [*a, *b] == GZIP_MAGIC => Some(Compression::Gzip),
            [a, b, ..] if (u16::from(*a) << 8 | u16::from(*b)) % 31 == 0 => Some(Compression::Zlib),
            _ => None,
        }
    }
}

/// Compress `payload` into a `kind` container.
pub fn compress(payload: &[u8], kind: Compression) -> Result<Vec<u8>> {
    let level = flate2::Compression::default();
    match kind {
        Compression::Gzip => {
            let mut enc = GzEncoder::new(Vec::with_capacity(payload.len() / 2), level);
            enc.write_all(payload).map_err(Error::decompress)?;
            enc.finish().map_err(Error::decompress)
        }
        Compression::Zlib => {
            let mut enc = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2), level);
            enc.write_all(payload).map_err(Error::decompress)?;
            enc.finish().map_err(Error::decompress)
        }
    }
}

/// Inflate a single container read from `rdr`, consuming no more than the container itself.
///
/// Returns the payload along with the container type. Streaming readers lean on the fact that the
/// underlying reader is left positioned just past the container.
pub(crate) fn decompress_from<R: BufRead>(
    head: &[u8],
    rdr: R,
    out: &mut Vec<u8>,
) -> Result<Compression> {
    match Compression::detect(head) {
        Some(Compression::Gzip) => {
            GzDecoder::new(rdr)
                .read_to_end(out)
                .map_err(Error::decompress)?;
            Ok(Compression::Gzip)
        }
        Some(Compression::Zlib) => {
            ZlibDecoder::new(rdr)
                .read_to_end(out)
                .map_err(Error::decompress)?;
            Ok(Compression::Zlib)
        }
        None => Err(Error::UnknownMagic {
            head: head.iter().take(2).copied().collect(),
            back: Backtrace::new(),
        }),
    }
}

/// Decompress `buf`, choosing the decoder from its leading bytes alone.
pub fn decompress_auto(buf: &[u8]) -> Result<(Vec<u8>, Compression)> {
    let mut out = Vec::with_capacity(buf.len() * 4);
    let kind = decompress_from(buf, buf, &mut out)?;
    Ok((out, kind))
}
