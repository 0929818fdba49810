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

//! From [`Message`]s to bytes on the wire, and back.
//!
//! Datagram path: JSON → compress → (if oversized) chunk. Stream path: JSON → compress →
//! trailing `0x00`. Chunking is never used on a stream.
//!
//! Splitting a stream back into messages needs no length prefix: a compressed container knows
//! where it ends, so [`StreamDecoder`] inflates one container & then expects the delimiter
//! immediately after it. Uncompressed JSON frames (which can't contain a raw `0x00`) are accepted
//! too, since that's what most GELF TCP senders emit.

use crate::{
    chunk::frame,
    compression::{compress, decompress_auto, decompress_from, Compression},
    error::{Error, Result},
    message::Message,
};

use backtrace::Backtrace;
use bytes::Bytes;

use std::io::Cursor;

/// Terminates each message on a stream transport
pub const DELIMITER: u8 = 0x00;

/// Encode `msg` into one or more datagrams of at most `chunk_size` bytes.
pub fn encode_datagrams(msg: &Message, kind: Compression, chunk_size: usize) -> Result<Vec<Bytes>> {
    let payload = compress(&msg.to_json()?, kind)?;
    Ok(frame(Bytes::from(payload), chunk_size)?.into_datagrams())
}

/// Encode `msg` into a single delimited stream frame.
pub fn encode_frame(msg: &Message, kind: Compression) -> Result<Vec<u8>> {
    let mut buf = compress(&msg.to_json()?, kind)?;
    buf.push(DELIMITER);
    Ok(buf)
}

/// Decode a complete (un-chunked) compressed payload.
pub fn decode_payload(buf: &[u8]) -> Result<Message> {
    let (json, _) = decompress_auto(buf)?;
    Message::from_json(&json)
}

/// The largest frame a [`StreamDecoder`] will buffer by default
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Incrementally split a byte stream into [`Message`]s.
///
/// At most `max_frame` bytes of an incomplete frame are buffered. Past that, the frame is
/// reported as [`Error::BadMessage`] & everything up to the next delimiter is thrown away.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    max_frame: usize,
    // Dropping the remains of an oversized frame
    discarding: bool,
    // Buffer length when a compressed frame last came up incomplete; it can't be finished until
    // a delimiter shows up past this point.
    stalled_at: Option<usize>,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        StreamDecoder::with_max_frame(MAX_FRAME_SIZE)
    }
}

impl StreamDecoder {
    pub fn new() -> StreamDecoder {
        StreamDecoder::default()
    }
    pub fn with_max_frame(max_frame: usize) -> StreamDecoder {
        StreamDecoder {
            buf: Vec::new(),
            max_frame,
            discarding: false,
            stalled_at: None,
        }
    }
    /// Append newly-received bytes
    pub fn extend(&mut self, data: &[u8]) {
        if self.discarding {
            if let Some(i) = data.iter().position(|&b| b == DELIMITER) {
                self.discarding = false;
                self.buf.extend_from_slice(&data[i + 1..]);
            }
        } else {
            self.buf.extend_from_slice(data);
        }
    }
    /// Number of bytes buffered but not yet decoded
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
    /// Pull the next message out of the buffer, if a complete one is present.
    ///
    /// `Some(Err(_))` reports a frame that could not be decoded; the decoder has already skipped
    /// past it, so the caller should just keep going.
    pub fn decode_next(&mut self) -> Option<Result<Message>> {
        // stray delimiters (e.g. keep-alives) carry nothing
        let skip = self.buf.iter().take_while(|&&b| b == DELIMITER).count();
        if skip > 0 {
            self.consume(skip);
        }

        let next = match self.buf.first().copied() {
            None => None,
            Some(b'{') => match self.buf.iter().position(|&b| b == DELIMITER) {
                Some(end) => {
                    let frame = self.buf[..end].to_vec();
                    self.consume(end + 1);
                    Some(Message::from_json(&frame))
                }
                None => None,
            },
            Some(_) if self.buf.len() < 2 => None,
            Some(_) => self.decode_compressed(),
        };
        match next {
            None if self.buf.len() > self.max_frame => Some(Err(self.discard_oversized())),
            next => next,
        }
    }

    /// Drop the first `n` buffered bytes
    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.stalled_at = None;
    }

    fn discard_oversized(&mut self) -> Error {
        let size = self.buf.len();
        self.buf.clear();
        self.stalled_at = None;
        self.discarding = true;
        Error::BadMessage {
            reason: format!(
                "frame exceeds {} bytes ({} buffered)",
                self.max_frame, size
            ),
            back: Backtrace::new(),
        }
    }

    fn decode_compressed(&mut self) -> Option<Result<Message>> {
        if let Some(at) = self.stalled_at {
            if !self.buf[at..].contains(&DELIMITER) {
                return None;
            }
        }
        let mut json = Vec::new();
        let mut cursor = Cursor::new(&self.buf[..]);
        let result = decompress_from(&self.buf, &mut cursor, &mut json);
        let end = cursor.position() as usize;
        match result {
            Ok(_) => match self.buf.get(end) {
                // the container is complete (or truncated); either way, wait for more
                None => self.stall(),
                Some(&DELIMITER) => {
                    self.consume(end + 1);
                    Some(Message::from_json(&json))
                }
                Some(_) => {
                    self.resync();
                    Some(Err(Error::BadMessage {
                        reason: "compressed frame was not followed by a delimiter".to_owned(),
                        back: Backtrace::new(),
                    }))
                }
            },
            // ran out of input mid-container: the rest hasn't arrived yet
            Err(Error::Decompress { source, .. })
                if source.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                self.stall()
            }
            Err(Error::Decompress { .. }) if end >= self.buf.len() => self.stall(),
            Err(err) => {
                self.resync();
                Some(Err(err))
            }
        }
    }

    fn stall(&mut self) -> Option<Result<Message>> {
        self.stalled_at = Some(self.buf.len());
        None
    }

    /// Discard bytes up to the next plausible frame start: a delimiter followed by something
    /// that looks like JSON or a compression container.
    fn resync(&mut self) {
        let start = (1..self.buf.len()).find(|&i| {
            self.buf[i - 1] == DELIMITER
                && (self.buf[i] == b'{' || Compression::detect(&self.buf[i..]).is_some())
        });
        match start {
            Some(i) => self.consume(i),
            // keep whatever follows the last delimiter; the next frame may be partially here
            None => match self.buf.iter().rposition(|&b| b == DELIMITER) {
                Some(i) => self.consume(i + 1),
                None => {
                    self.buf.clear();
                    self.stalled_at = None;
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::chunk::{classify, Unit, CHUNK_MAGIC, DEFAULT_CHUNK_SIZE, MAX_CHUNKS};
    use crate::reassembly::ReassemblyTable;

    use base64::Engine;
    use rand::{seq::SliceRandom, RngCore};

    fn msg(text: &str) -> Message {
        Message::from_text("bree", text)
            .unwrap()
            .timestamp(1.5)
            .build()
            .unwrap()
    }

    #[test]
    fn test_small_datagram() {
        for kind in [Compression::Gzip, Compression::Zlib] {
            let m = msg("awesomesauce\nbananas");
            let datagrams = encode_datagrams(&m, kind, 1420).unwrap();
            assert_eq!(datagrams.len(), 1);
            assert!(!datagrams[0].starts_with(&CHUNK_MAGIC));
            assert_eq!(Compression::detect(&datagrams[0]), Some(kind));
            assert_eq!(decode_payload(&datagrams[0]).unwrap(), m);
        }
    }

    #[test]
    fn test_chunked_datagrams() {
        // Non-repetitive text, so that it doesn't compress down to nothing
        let text = (0..4000)
            .map(|i| format!("{:x}", i * 2654435761u64))
            .collect::<Vec<String>>()
            .join(" ");
        let m = msg(&text);
        let datagrams = encode_datagrams(&m, Compression::Gzip, 256).unwrap();
        assert!(datagrams.len() > 1);
        assert!(datagrams.iter().all(|d| d.len() <= 256));

        let mut table = ReassemblyTable::new();
        let mut out = None;
        for d in datagrams.iter().rev() {
            match classify(d).unwrap() {
                Unit::Chunk(c) => out = table.insert(c).or(out),
                Unit::Whole(_) => panic!("expected chunks"),
            }
        }
        assert_eq!(decode_payload(&out.unwrap()).unwrap(), m);
    }

    #[test]
    fn test_default_chunk_size_near_limit() {
        let mut noise = vec![0u8; 150_000];
        rand::thread_rng().fill_bytes(&mut noise);
        let text = format!(
            "awesomesauce\n{}",
            base64::engine::general_purpose::STANDARD.encode(&noise)
        );
        let m = msg(&text);
        let mut datagrams = encode_datagrams(&m, Compression::Gzip, DEFAULT_CHUNK_SIZE).unwrap();
        assert!(datagrams.len() > 100);
        assert!(datagrams.len() <= MAX_CHUNKS);
        assert!(datagrams.iter().all(|d| d.len() <= DEFAULT_CHUNK_SIZE));

        datagrams.shuffle(&mut rand::thread_rng());
        let mut table = ReassemblyTable::new();
        let mut out = None;
        for d in &datagrams {
            match classify(d).unwrap() {
                Unit::Chunk(c) => {
                    assert!(out.is_none());
                    out = table.insert(c);
                }
                Unit::Whole(_) => panic!("expected chunks"),
            }
        }
        assert_eq!(table.stats().completed, 1);
        assert!(table.is_empty());
        let got = decode_payload(&out.unwrap()).unwrap();
        assert_eq!(got.short(), "awesomesauce");
        assert_eq!(got.full(), text);
    }

    #[test]
    fn test_oversized() {
        let text = (0..40000)
            .map(|i| format!("{:x}", i * 2654435761u64))
            .collect::<Vec<String>>()
            .join(" ");
        match encode_datagrams(&msg(&text), Compression::Zlib, 64) {
            Err(Error::TooManyChunks { count, max, .. }) => {
                assert!(count > MAX_CHUNKS);
                assert_eq!(max, MAX_CHUNKS);
            }
            _ => panic!("expected TooManyChunks"),
        }
    }

    #[test]
    fn test_stream_frames() {
        let a = msg("First message\nThis happens before");
        let b = msg("Second message");
        let mut wire = encode_frame(&a, Compression::Gzip).unwrap();
        assert_eq!(wire.last(), Some(&DELIMITER));
        wire.extend(encode_frame(&b, Compression::Zlib).unwrap());
        wire.extend(b"{\"version\":\"1.1\",\"host\":\"h\",\"short_message\":\"plain\"}\0");

        // Dribble the bytes in one at a time; each message must pop out exactly once
        let mut decoder = StreamDecoder::new();
        let mut got = Vec::new();
        for byte in wire {
            decoder.extend(&[byte]);
            while let Some(m) = decoder.decode_next() {
                got.push(m.unwrap());
            }
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], a);
        assert_eq!(got[1], b);
        assert_eq!(got[2].short(), "plain");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_stream_garbage() {
        let a = msg("after the garbage");
        let mut wire = b"\x01\x02\x03garbage\0".to_vec();
        wire.extend(encode_frame(&a, Compression::Gzip).unwrap());

        let mut decoder = StreamDecoder::new();
        decoder.extend(&wire);
        assert!(matches!(
            decoder.decode_next(),
            Some(Err(Error::UnknownMagic { .. }))
        ));
        assert_eq!(decoder.decode_next().unwrap().unwrap(), a);
        assert!(decoder.decode_next().is_none());
    }

    #[test]
    fn test_stream_oversized_frame() {
        let mut decoder = StreamDecoder::with_max_frame(1024);
        let mut flood = b"{\"version\":\"1.1\",\"host\":\"h\",\"short_message\":\"".to_vec();
        flood.extend(std::iter::repeat(b'a').take(2000));
        decoder.extend(&flood);
        assert!(matches!(
            decoder.decode_next(),
            Some(Err(Error::BadMessage { .. }))
        ));
        assert_eq!(decoder.pending(), 0);

        // The rest of the oversized frame is dropped; the frame after it comes through
        decoder.extend(&[b'a'; 100]);
        assert!(decoder.decode_next().is_none());
        assert_eq!(decoder.pending(), 0);
        let a = msg("after the flood");
        let mut wire = b"aaaa\"}\0".to_vec();
        wire.extend(encode_frame(&a, Compression::Zlib).unwrap());
        decoder.extend(&wire);
        assert_eq!(decoder.decode_next().unwrap().unwrap(), a);
        assert!(decoder.decode_next().is_none());
    }

    #[test]
    fn test_stream_compressed_frame_in_pieces() {
        let text = (0..2000)
            .map(|i| format!("{:x}", i * 2654435761u64))
            .collect::<Vec<String>>()
            .join(" ");
        let a = msg(&text);
        let wire = encode_frame(&a, Compression::Gzip).unwrap();
        let (body, delimiter) = wire.split_at(wire.len() - 1);

        let mut decoder = StreamDecoder::new();
        for piece in body.chunks(97) {
            decoder.extend(piece);
            assert!(decoder.decode_next().is_none());
        }
        assert_eq!(decoder.pending(), body.len());
        decoder.extend(delimiter);
        assert_eq!(decoder.decode_next().unwrap().unwrap(), a);
        assert_eq!(decoder.pending(), 0);
    }
}
