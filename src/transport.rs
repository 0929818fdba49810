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

//! The GELF transport layer.
//!
//! This module defines the [`Transport`] trait that all implementations must support, as well
//! as the UDP implementation. The streaming (TCP & TLS) implementation lives in
//! [`stream`](crate::stream).
//!
//! # Examples
//!
//! To send GELF messages over UDP to a collector listening on port 12201 (the default) on
//! localhost:
//!
//! ```rust
//! use tracing_gelf::transport::UdpWriter;
//! let transpo = UdpWriter::local().unwrap();
//! ```
//!
//! On a non-standard port on another host, zlib-compressed, in smaller chunks:
//!
//! ```rust
//! use tracing_gelf::{compression::Compression, transport::UdpWriter};
//! let transpo = UdpWriter::builder("some-host.domain.io:5514").and_then(|builder| {
//!     builder
//!         .compression(Compression::Zlib)
//!         .chunk_size(512)
//!         .build()
//! });
//! assert!(transpo.is_err()); // no such host, after all
//! ```

use crate::{
    chunk::{check_chunk_size, DEFAULT_CHUNK_SIZE},
    codec::encode_datagrams,
    compression::Compression,
    error::{Error, Result},
    host::{HostnameProvider, SystemHostname},
    level::Level,
    message::Message,
};

use backtrace::Backtrace;

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{Mutex, PoisonError},
};

/// The conventional GELF port
pub const DEFAULT_PORT: u16 = 12201;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      transport mechanisms                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Operations all transport layers must support.
pub trait Transport {
    /// Send one message on this transport mechanism.
    fn send(&self, message: &Message) -> Result<()>;
    /// The host name this transport stamps on the messages it builds
    fn hostname(&self) -> &str;
    /// Build a message from free-form `text` & send it, recording the caller's source location.
    #[track_caller]
    fn log(&self, level: Level, text: &str) -> Result<()> {
        let caller = std::panic::Location::caller();
        let msg = Message::from_text(self.hostname(), text)?
            .level(level)
            .call_site(caller.file(), caller.line())
            .build()?;
        self.send(&msg)
    }
}

pub(crate) fn resolve<A: ToSocketAddrs>(addr: A) -> Result<Vec<SocketAddr>> {
    let addrs = addr
        .to_socket_addrs()
        .map_err(Error::transport)?
        .collect::<Vec<SocketAddr>>();
    if addrs.is_empty() {
        Err(Error::transport(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        )))
    } else {
        Ok(addrs)
    }
}

/// Sending GELF messages via UDP datagrams, chunking them where necessary.
pub struct UdpWriter {
    // A shared socket handle isn't safe for concurrent writers on every platform; serialize.
    socket: Mutex<UdpSocket>,
    hostname: String,
    compression: Compression,
    chunk_size: usize,
}

/// Incrementally configure a [`UdpWriter`]
pub struct UdpWriterBuilder {
    addrs: Vec<SocketAddr>,
    hostname: Option<String>,
    compression: Compression,
    chunk_size: usize,
}

impl UdpWriterBuilder {
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
    /// Largest datagram to send, chunk header included
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
    pub fn hostname_as_string(mut self, hostname: String) -> Self {
        self.hostname = Some(hostname);
        self
    }
    pub fn hostname_provider<P: HostnameProvider>(mut self, provider: P) -> Result<Self> {
        self.hostname = Some(provider.hostname()?);
        Ok(self)
    }
    pub fn build(self) -> Result<UdpWriter> {
        check_chunk_size(self.chunk_size)?;
        let hostname = match self.hostname {
            Some(hostname) => hostname,
            None => SystemHostname.hostname()?,
        };
        // Bind to any available port on the wildcard address of the right family...
        let local = match self.addrs[0].ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).map_err(Error::transport)?;
        // and connect to the collector:
        socket.connect(&self.addrs[..]).map_err(Error::transport)?;
        Ok(UdpWriter {
            socket: Mutex::new(socket),
            hostname,
            compression: self.compression,
            chunk_size: self.chunk_size,
        })
    }
}

impl UdpWriter {
    /// Start configuring a [`UdpWriter`] that will send to `addr`.
    pub fn builder<A: ToSocketAddrs>(addr: A) -> Result<UdpWriterBuilder> {
        Ok(UdpWriterBuilder {
            addrs: resolve(addr)?,
            hostname: None,
            compression: Compression::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }
    /// Construct a [`UdpWriter`] with default settings sending to `addr`.
    pub fn new<A: ToSocketAddrs>(addr: A) -> Result<UdpWriter> {
        UdpWriter::builder(addr)?.build()
    }
    /// Construct a [`UdpWriter`] sending to localhost:12201
    pub fn local() -> Result<UdpWriter> {
        UdpWriter::new(("localhost", DEFAULT_PORT))
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .local_addr()
            .map_err(Error::transport)
    }
}

impl Transport for UdpWriter {
    /// Serialize, compress & (if need be) chunk `message`, then write each resulting unit as its
    /// own datagram. Nothing is acknowledged; a datagram the socket accepted counts as delivered.
    fn send(&self, message: &Message) -> Result<()> {
        let datagrams = encode_datagrams(message, self.compression, self.chunk_size)?;
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        for datagram in datagrams {
            let n = socket.send(&datagram).map_err(Error::transport)?;
            if n != datagram.len() {
                return Err(Error::PartialWrite {
                    written: n,
                    total: datagram.len(),
                    back: Backtrace::new(),
                });
            }
        }
        Ok(())
    }
    fn hostname(&self) -> &str {
        &self.hostname
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        chunk::{classify, Unit},
        codec::decode_payload,
        reassembly::ReassemblyTable,
    };

    #[test]
    fn test_new_writer() {
        assert!(UdpWriter::new("").is_err());
        assert!(matches!(
            UdpWriter::builder("127.0.0.1:12201")
                .unwrap()
                .hostname_as_string("bree".to_owned())
                .chunk_size(12)
                .build(),
            Err(Error::BadChunkSize { size: 12, .. })
        ));
    }

    #[test]
    fn test_send_small() {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        for kind in [Compression::Gzip, Compression::Zlib] {
            let w = UdpWriter::builder(sink.local_addr().unwrap())
                .unwrap()
                .hostname_as_string("bree".to_owned())
                .compression(kind)
                .build()
                .unwrap();
            assert_eq!(w.hostname(), "bree");
            w.log(Level::LOG_NOTICE, "awesomesauce\nbananas").unwrap();
            let line = line!() - 1;

            let mut buf = vec![0u8; 65536];
            let n = sink.recv(&mut buf).unwrap();
            assert_eq!(Compression::detect(&buf[..n]), Some(kind));
            let msg = decode_payload(&buf[..n]).unwrap();
            assert_eq!(msg.host(), "bree");
            assert_eq!(msg.short(), "awesomesauce");
            assert_eq!(msg.full(), "awesomesauce\nbananas");
            assert_eq!(msg.level(), Level::LOG_NOTICE);
            assert!(msg.file().unwrap().ends_with("transport.rs"));
            assert_eq!(msg.line(), Some(line));
        }
    }

    #[test]
    fn test_send_chunked_zlib() {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let w = UdpWriter::builder(sink.local_addr().unwrap())
            .unwrap()
            .hostname_as_string("bree".to_owned())
            .compression(Compression::Zlib)
            .chunk_size(512)
            .build()
            .unwrap();
        let text = (0..400)
            .map(|i| format!("{:x}", i * 2654435761u64))
            .collect::<Vec<String>>()
            .join(" ");
        w.log(Level::LOG_INFO, &text).unwrap();

        let mut table = ReassemblyTable::new();
        let mut buf = vec![0u8; 65536];
        let payload = loop {
            let n = sink.recv(&mut buf).unwrap();
            assert!(n <= 512);
            match classify(&buf[..n]).unwrap() {
                Unit::Chunk(chunk) => {
                    if let Some(payload) = table.insert(chunk) {
                        break payload;
                    }
                }
                Unit::Whole(_) => panic!("expected chunks"),
            }
        };
        assert_eq!(Compression::detect(&payload), Some(Compression::Zlib));
        assert_eq!(decode_payload(&payload).unwrap().short(), text);
    }
}
