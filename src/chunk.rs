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

//! GELF chunking.
//!
//! # Introduction
//!
//! A compressed GELF payload that won't fit into one datagram is split into at most
//! [`MAX_CHUNKS`] chunks, each prefixed with a twelve-byte header:
//!
//! ```text
//!  0      2                  10    11    12
//! +------+------------------+-----+-----+-----------------------+
//! | 1e0f |    message id    | seq | cnt | compressed body bytes |
//! +------+------------------+-----+-----+-----------------------+
//! ```
//!
//! Payloads that do fit are sent bare. There is no type tag: a receiver tells the two apart by
//! the leading bytes alone. The chunk magic must therefore be checked _before_ the compression
//! magic, and the two byte ranges must never overlap: `1e 0f` is neither the gzip magic (`1f 8b`)
//! nor a multiple of 31 (so never a zlib header).
//!
//! Message identifiers are eight random bytes; they need only be unique among the messages in
//! flight from one sender to one receiver within the reassembly window.

use crate::{
    compression::Compression,
    error::{Error, Result},
};

use backtrace::Backtrace;
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tracing::trace;

/// The two bytes that open every chunk
pub const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];
/// Size of the chunk header, magic included
pub const HEADER_LEN: usize = 12;
/// The most chunks into which one message may be split
pub const MAX_CHUNKS: usize = 128;
/// Chosen to keep datagrams under a typical path MTU once IP & UDP headers are added
pub const DEFAULT_CHUNK_SIZE: usize = 1420;

/// Eight opaque bytes tying a message's chunks together
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 8]);

impl MessageId {
    /// A fresh identifier from a cryptographically secure generator
    pub fn random() -> MessageId {
        MessageId(rand::thread_rng().gen())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One fragment of a chunked message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub id: MessageId,
    /// zero-based position of this chunk
    pub index: u8,
    /// total number of chunks in the message
    pub count: u8,
    pub body: Bytes,
}

impl Chunk {
    /// Parse a datagram already known to begin with [`CHUNK_MAGIC`].
    ///
    /// Enforces `0 < count <= MAX_CHUNKS` & `index < count`.
    pub fn parse(buf: &[u8]) -> Result<Chunk> {
        match *buf {
            [m0, m1, b2, b3, b4, b5, b6, b7, b8, b9, index, count, ref body @ ..]
                if [m0, m1] == CHUNK_MAGIC =>
            {
                if count == 0 {
                    return Err(Error::bad_chunk_header("sequence count of zero"));
                }
                if usize::from(count) > MAX_CHUNKS {
                    return Err(Error::bad_chunk_header(format!(
                        "sequence count {} exceeds the maximum of {}",
                        count, MAX_CHUNKS
                    )));
                }
                if index >= count {
                    return Err(Error::bad_chunk_header(format!(
                        "sequence index {} is out of range for a count of {}",
                        index, count
                    )));
                }
                Ok(Chunk {
                    id: MessageId([b2, b3, b4, b5, b6, b7, b8, b9]),
                    index,
                    count,
                    body: Bytes::copy_from_slice(body),
                })
            }
            [m0, m1, ..] if [m0, m1] == CHUNK_MAGIC => Err(Error::bad_chunk_header(format!(
                "datagram of {} bytes is too short to hold a chunk header",
                buf.len()
            ))),
            _ => Err(Error::UnknownMagic {
                head: buf.iter().take(2).copied().collect(),
                back: Backtrace::new(),
            }),
        }
    }
    /// Produce the on-the-wire form of this chunk: header followed by body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        buf.put_slice(&CHUNK_MAGIC);
        buf.put_slice(&self.id.0);
        buf.put_u8(self.index);
        buf.put_u8(self.count);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// A received datagram, classified by its leading bytes
#[derive(Debug)]
pub enum Unit<'a> {
    /// A complete compressed payload
    Whole(&'a [u8]),
    Chunk(Chunk),
}

/// Classify a datagram. The chunk magic is checked first, then the compression magics.
pub fn classify(datagram: &[u8]) -> Result<Unit<'_>> {
    if datagram.starts_with(&CHUNK_MAGIC) {
        Ok(Unit::Chunk(Chunk::parse(datagram)?))
    } else if Compression::detect(datagram).is_some() {
        Ok(Unit::Whole(datagram))
    } else {
        Err(Error::UnknownMagic {
            head: datagram.iter().take(2).copied().collect(),
            back: Backtrace::new(),
        })
    }
}

/// The result of framing one compressed payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Framed {
    /// The payload fit in one datagram & goes out bare
    Whole(Bytes),
    /// The payload was split; chunks are in index order
    Chunked(Vec<Chunk>),
}

impl Framed {
    /// The datagrams to be sent, in order
    pub fn into_datagrams(self) -> Vec<Bytes> {
        match self {
            Framed::Whole(payload) => vec![payload],
            Framed::Chunked(chunks) => chunks.iter().map(Chunk::encode).collect(),
        }
    }
}

/// Check that `chunk_size` leaves room for at least one byte of payload after the header.
pub fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size <= HEADER_LEN {
        Err(Error::BadChunkSize {
            size: chunk_size,
            back: Backtrace::new(),
        })
    } else {
        Ok(())
    }
}

/// Split `payload` into datagrams of at most `chunk_size` bytes under a fresh message id.
pub fn frame(payload: Bytes, chunk_size: usize) -> Result<Framed> {
    frame_with_id(payload, chunk_size, MessageId::random())
}

pub(crate) fn frame_with_id(payload: Bytes, chunk_size: usize, id: MessageId) -> Result<Framed> {
    check_chunk_size(chunk_size)?;
    if payload.len() + HEADER_LEN <= chunk_size {
        return Ok(Framed::Whole(payload));
    }

    let max_body = chunk_size - HEADER_LEN;
    let count = payload.len().div_ceil(max_body);
    trace!(
        message_id = %id,
        chunk_count = count,
        chunk_size = chunk_size,
        "Chunking GELF payload."
    );
    if count > MAX_CHUNKS {
        return Err(Error::TooManyChunks {
            count,
            max: MAX_CHUNKS,
            back: Backtrace::new(),
        });
    }

    // `count` <= MAX_CHUNKS, so the casts below can't truncate.
    Ok(Framed::Chunked(
        (0..count)
            .map(|i| {
                let start = i * max_body;
                let end = std::cmp::min(start + max_body, payload.len());
                Chunk {
                    id,
                    index: i as u8,
                    count: count as u8,
                    body: payload.slice(start..end),
                }
            })
            .collect(),
    ))
}

/// Concatenate chunk bodies, supplied in index order, back into the compressed payload.
pub fn unframe<I, B>(bodies: I) -> Vec<u8>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    bodies.into_iter().fold(Vec::new(), |mut acc, body| {
        acc.extend_from_slice(body.as_ref());
        acc
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_noop() {
        let input = Bytes::from("1234123412341234123");
        let framed = frame(input.clone(), 8192).unwrap();
        assert_eq!(framed, Framed::Whole(input.clone()));
        assert_eq!(framed.into_datagrams(), vec![input.clone()]);
        // Exactly at the boundary: still one unit
        assert_eq!(
            frame(input.clone(), input.len() + HEADER_LEN).unwrap(),
            Framed::Whole(input)
        );
    }

    #[test]
    fn test_chunk() {
        let id = MessageId([1, 2, 3, 4, 5, 6, 7, 8]);
        // Input for 5 chunks of 4 bytes: [1234] [1234] [1234] [1234] [123]
        let input = Bytes::from("1234123412341234123");
        let framed = frame_with_id(input.clone(), HEADER_LEN + 4, id).unwrap();
        let datagrams = framed.into_datagrams();
        assert_eq!(datagrams.len(), 5);

        for (i, d) in datagrams.iter().enumerate() {
            assert_eq!(d[0..2], CHUNK_MAGIC);
            assert_eq!(d[2..10], id.0);
            assert_eq!(d[10], i as u8);
            assert_eq!(d[11], 5);
            if i < 4 {
                assert_eq!(&d[HEADER_LEN..], b"1234");
            } else {
                assert_eq!(&d[HEADER_LEN..], b"123");
            }
            let chunk = Chunk::parse(d).unwrap();
            assert_eq!(chunk.id, id);
            assert_eq!(usize::from(chunk.index), i);
        }

        let bodies = datagrams
            .iter()
            .map(|d| Chunk::parse(d).unwrap().body)
            .collect::<Vec<Bytes>>();
        assert_eq!(unframe(bodies), input.to_vec());
    }

    #[test]
    fn test_max() {
        let input = Bytes::from(vec![0u8; 4 * MAX_CHUNKS]);
        match frame(input.clone(), HEADER_LEN + 4).unwrap() {
            Framed::Chunked(chunks) => assert_eq!(chunks.len(), MAX_CHUNKS),
            _ => panic!("expected chunks"),
        }
        // One byte more needs a 129th chunk
        let input = Bytes::from(vec![0u8; 4 * MAX_CHUNKS + 1]);
        match frame(input, HEADER_LEN + 4) {
            Err(Error::TooManyChunks { count, max, .. }) => {
                assert_eq!(count, MAX_CHUNKS + 1);
                assert_eq!(max, MAX_CHUNKS);
            }
            _ => panic!("expected TooManyChunks"),
        }
    }

    #[test]
    fn test_bad_chunk_size() {
        assert!(matches!(
            frame(Bytes::from("x"), HEADER_LEN),
            Err(Error::BadChunkSize { .. })
        ));
    }

    #[test]
    fn test_parse_errors() {
        let mut hdr = vec![0x1e, 0x0f, 0, 0, 0, 0, 0, 0, 0, 1];
        // too short
        assert!(matches!(Chunk::parse(&hdr), Err(Error::BadChunkHeader { .. })));
        // count of zero
        hdr.extend_from_slice(&[0, 0, 0xaa]);
        assert!(matches!(Chunk::parse(&hdr), Err(Error::BadChunkHeader { .. })));
        // index >= count
        hdr[10] = 3;
        hdr[11] = 3;
        assert!(matches!(Chunk::parse(&hdr), Err(Error::BadChunkHeader { .. })));
        // count > MAX_CHUNKS
        hdr[10] = 0;
        hdr[11] = 129;
        assert!(matches!(Chunk::parse(&hdr), Err(Error::BadChunkHeader { .. })));
        hdr[11] = 128;
        assert!(Chunk::parse(&hdr).is_ok());
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(&[0x1f, 0x8b, 0x08, 0x00]),
            Ok(Unit::Whole(_))
        ));
        assert!(matches!(classify(&[0x78, 0x9c, 0x01]), Ok(Unit::Whole(_))));
        let chunk = Chunk {
            id: MessageId([0xff; 8]),
            index: 0,
            count: 2,
            body: Bytes::from_static(b"body"),
        };
        match classify(&chunk.encode()) {
            Ok(Unit::Chunk(c)) => assert_eq!(c, chunk),
            _ => panic!("expected a chunk"),
        }
        assert!(matches!(classify(b"{}"), Err(Error::UnknownMagic { .. })));
        assert!(matches!(classify(&[]), Err(Error::UnknownMagic { .. })));
    }

    #[test]
    fn test_message_id() {
        assert_eq!(
            format!("{}", MessageId([0, 1, 0xab, 3, 4, 5, 6, 0xff])),
            "0001ab03040506ff"
        );
        assert_ne!(MessageId::random(), MessageId::random());
    }
}
