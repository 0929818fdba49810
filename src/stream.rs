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

//! Streaming GELF transports: TCP, and TLS over TCP.
//!
//! # Introduction
//!
//! On a stream, each message is compressed & terminated with a single `0x00`; messages are never
//! chunked. The [`StreamWriter`] keeps one connection open. When a write fails, it drops that
//! connection & dials a new one, up to a configurable number of times, pausing between attempts.
//! A message is either written to a connection in full, or re-sent in full on the next one: a
//! write that the connection accepts only part of counts as a failure like any other. If the
//! budget is exhausted, the writer fails permanently; construct a new one to try again.
//!
//! How a connection is established is abstracted behind the [`Dialer`] trait. [`TcpDialer`] makes
//! plain TCP connections; with the `tls` feature enabled, `TlsDialer` wraps them in TLS.
//!
//! # Examples
//!
//! ```no_run
//! use tracing_gelf::{level::Level, stream::StreamWriter, transport::Transport};
//! let w = StreamWriter::tcp("graylog.local:12201").unwrap();
//! w.log(Level::LOG_INFO, "Hello, world!").unwrap();
//! ```

use crate::{
    codec::encode_frame,
    compression::Compression,
    error::{Error, Result},
    host::{HostnameProvider, SystemHostname},
    message::Message,
    transport::{resolve, Transport},
};

use backtrace::Backtrace;
use tracing::{debug, error, warn};

use std::{
    io::{self, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::{Mutex, PoisonError},
    time::Duration,
};

/// How many times to dial a new connection after a write fails
pub const DEFAULT_MAX_RECONNECT: usize = 3;
/// How long to wait between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            dialers                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Something that can open a fresh connection to the collector
pub trait Dialer {
    type Conn: Write;
    fn dial(&self) -> io::Result<Self::Conn>;
}

/// Dial plain TCP connections
#[derive(Clone, Debug)]
pub struct TcpDialer {
    addrs: Vec<SocketAddr>,
    timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new<A: ToSocketAddrs>(addr: A) -> Result<TcpDialer> {
        Ok(TcpDialer {
            addrs: resolve(addr)?,
            timeout: None,
        })
    }
    /// Give up on each connection attempt after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> TcpDialer {
        self.timeout = Some(timeout);
        self
    }
}

impl Dialer for TcpDialer {
    type Conn = TcpStream;
    fn dial(&self) -> io::Result<TcpStream> {
        let stream = match self.timeout {
            None => TcpStream::connect(&self.addrs[..])?,
            Some(timeout) => {
                let mut last = None;
                let mut stream = None;
                for addr in &self.addrs {
                    match TcpStream::connect_timeout(addr, timeout) {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(err) => last = Some(err),
                    }
                }
                match stream {
                    Some(s) => s,
                    None => {
                        return Err(last.unwrap_or_else(|| {
                            io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to dial")
                        }))
                    }
                }
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Dial TLS connections on top of [`TcpDialer`]
#[cfg(feature = "tls")]
pub struct TlsDialer {
    tcp: TcpDialer,
    domain: String,
    connector: openssl::ssl::SslConnector,
}

#[cfg(feature = "tls")]
impl TlsDialer {
    /// Verify the peer against the system trust store, expecting its certificate to name `domain`
    pub fn new<A: ToSocketAddrs>(addr: A, domain: &str) -> Result<TlsDialer> {
        let builder = openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls())
            .map_err(|err| Error::transport(io::Error::new(io::ErrorKind::Other, err)))?;
        TlsDialer::with_connector(addr, domain, builder)
    }
    /// Use a caller-configured connector (custom roots, client certificates & so forth).
    ///
    /// Partial writes are switched off on the connector, so that each frame goes out in a single
    /// `SSL_write`.
    pub fn with_connector<A: ToSocketAddrs>(
        addr: A,
        domain: &str,
        mut builder: openssl::ssl::SslConnectorBuilder,
    ) -> Result<TlsDialer> {
        builder.clear_mode(openssl::ssl::SslMode::ENABLE_PARTIAL_WRITE);
        Ok(TlsDialer {
            tcp: TcpDialer::new(addr)?,
            domain: domain.to_owned(),
            connector: builder.build(),
        })
    }
}

#[cfg(feature = "tls")]
impl Dialer for TlsDialer {
    type Conn = openssl::ssl::SslStream<TcpStream>;
    fn dial(&self) -> io::Result<Self::Conn> {
        let tcp = self.tcp.dial()?;
        self.connector
            .connect(&self.domain, tcp)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            writer                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Where a [`StreamWriter`] stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The last write failed & reconnection is underway
    Reconnecting,
    /// The reconnect budget was exhausted; the writer is permanently unusable
    Failed,
    /// [`StreamWriter::close`] was called
    Closed,
}

enum State<C> {
    Connected(C),
    Reconnecting,
    Failed,
    Closed,
}

impl<C> State<C> {
    fn public(&self) -> ConnectionState {
        match self {
            State::Connected(_) => ConnectionState::Connected,
            State::Reconnecting => ConnectionState::Reconnecting,
            State::Failed => ConnectionState::Failed,
            State::Closed => ConnectionState::Closed,
        }
    }
}

/// Write `frame` in one call & flush. A short write is reported as [`io::ErrorKind::WriteZero`];
/// the remainder is never sent on its own.
fn write_frame<W: Write>(conn: &mut W, frame: &[u8]) -> io::Result<()> {
    loop {
        match conn.write(frame) {
            Ok(n) if n == frame.len() => return conn.flush(),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes", n, frame.len()),
                ))
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Sending GELF messages over a reconnecting stream
pub struct StreamWriter<D: Dialer> {
    dialer: D,
    // Held across the entire write-or-reconnect sequence: concurrent callers queue up behind
    // one another, so frames are never interleaved on the wire.
    state: Mutex<State<D::Conn>>,
    hostname: String,
    compression: Compression,
    max_reconnect: usize,
    reconnect_delay: Duration,
}

/// Incrementally configure a [`StreamWriter`]
pub struct StreamWriterBuilder<D: Dialer> {
    dialer: D,
    hostname: Option<String>,
    compression: Compression,
    max_reconnect: usize,
    reconnect_delay: Duration,
}

impl<D: Dialer> StreamWriterBuilder<D> {
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
    pub fn max_reconnect(mut self, max_reconnect: usize) -> Self {
        self.max_reconnect = max_reconnect;
        self
    }
    pub fn reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
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
    /// Make the initial connection; failure here is reported, not retried.
    pub fn build(self) -> Result<StreamWriter<D>> {
        let hostname = match self.hostname {
            Some(hostname) => hostname,
            None => SystemHostname.hostname()?,
        };
        let conn = self.dialer.dial().map_err(Error::transport)?;
        Ok(StreamWriter {
            dialer: self.dialer,
            state: Mutex::new(State::Connected(conn)),
            hostname,
            compression: self.compression,
            max_reconnect: self.max_reconnect,
            reconnect_delay: self.reconnect_delay,
        })
    }
}

impl StreamWriter<TcpDialer> {
    /// Connect over plain TCP with default settings
    pub fn tcp<A: ToSocketAddrs>(addr: A) -> Result<StreamWriter<TcpDialer>> {
        StreamWriter::builder(TcpDialer::new(addr)?).build()
    }
}

#[cfg(feature = "tls")]
impl StreamWriter<TlsDialer> {
    /// Connect over TLS with default settings
    pub fn tls<A: ToSocketAddrs>(addr: A, domain: &str) -> Result<StreamWriter<TlsDialer>> {
        StreamWriter::builder(TlsDialer::new(addr, domain)?).build()
    }
}

impl<D: Dialer> StreamWriter<D> {
    pub fn builder(dialer: D) -> StreamWriterBuilder<D> {
        StreamWriterBuilder {
            dialer,
            hostname: None,
            compression: Compression::default(),
            max_reconnect: DEFAULT_MAX_RECONNECT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .public()
    }
    /// Shut the writer down. Subsequent writes fail with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let prior = std::mem::replace(&mut *state, State::Closed);
        match prior {
            State::Connected(mut conn) => conn.flush().map_err(Error::transport),
            _ => Ok(()),
        }
    }
    /// Write one message, reconnecting if need be.
    pub fn write(&self, message: &Message) -> Result<()> {
        let frame = encode_frame(message, self.compression)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let err = match &mut *state {
            State::Connected(conn) => match write_frame(conn, &frame) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            },
            State::Failed | State::Closed => {
                return Err(Error::Closed {
                    back: Backtrace::new(),
                })
            }
            // We only pass through this state while holding the lock, but a panic mid-reconnect
            // could leave us here; treat it like a failed write.
            State::Reconnecting => io::Error::new(io::ErrorKind::NotConnected, "not connected"),
        };

        warn!(error = %err, "GELF stream write failed; reconnecting.");
        // Dropping the old connection closes it.
        *state = State::Reconnecting;
        let mut last = Some(err);
        for attempt in 1..=self.max_reconnect {
            if attempt > 1 {
                std::thread::sleep(self.reconnect_delay);
            }
            let result = self
                .dialer
                .dial()
                .and_then(|mut conn| write_frame(&mut conn, &frame).map(|_| conn));
            match result {
                Ok(conn) => {
                    debug!(attempt, "Reconnected GELF stream.");
                    *state = State::Connected(conn);
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "GELF stream reconnect attempt failed.");
                    last = Some(err);
                }
            }
        }

        error!(
            attempts = self.max_reconnect,
            "Exhausted GELF stream reconnect budget; giving up."
        );
        *state = State::Failed;
        Err(Error::ReconnectExhausted {
            attempts: self.max_reconnect,
            source: last,
            back: Backtrace::new(),
        })
    }
}

impl<D: Dialer> Transport for StreamWriter<D> {
    fn send(&self, message: &Message) -> Result<()> {
        self.write(message)
    }
    fn hostname(&self) -> &str {
        &self.hostname
    }
}
