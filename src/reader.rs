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

//! Receiving GELF messages.
//!
//! [`UdpReader`] binds a datagram socket, reassembles chunked messages & decodes whole ones.
//! [`StreamReader`] accepts TCP (or, with the `tls` feature, TLS) connections & splits each into
//! delimited frames.
//!
//! Both offer a blocking `receive` that returns the next complete message, and a `poll` that
//! reports what one pass over the socket turned up as a [`Polled`]. Errors are of two kinds. A
//! message that can't be decoded is reported as a protocol error (see [`Error::is_protocol`]) &
//! the reader remains usable. A failure of the socket itself is reported as [`Error::Transport`];
//! treat it as the end of the stream.
//!
//! A chunk with a malformed header is dropped & logged rather than reported: it belongs to no
//! message we could name.

use crate::{
    chunk::{classify, Unit},
    codec::{decode_payload, StreamDecoder},
    error::{Error, Result},
    message::Message,
    reassembly::{ReassemblyStats, ReassemblyTable},
};

use tracing::{debug, warn};

use std::{
    collections::VecDeque,
    io::{self, Read},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

/// Large enough for any UDP datagram
const RECV_BUFFER_SIZE: usize = 65536;
/// How long a [`StreamReader`] sleeps when it finds nothing to do
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// The outcome of a single `poll`
#[derive(Debug)]
pub enum Polled {
    /// A complete message
    Message(Message),
    /// Something was read, but it didn't complete a message (a chunk, say, or a partial frame)
    Pending,
    /// Nothing was waiting on the socket
    Idle,
}

impl Polled {
    pub fn into_message(self) -> Option<Message> {
        match self {
            Polled::Message(msg) => Some(msg),
            Polled::Pending | Polled::Idle => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              UDP                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Receive GELF messages as UDP datagrams
pub struct UdpReader {
    socket: UdpSocket,
    table: ReassemblyTable,
    buf: Vec<u8>,
}

impl UdpReader {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<UdpReader> {
        UdpReader::with_table(addr, ReassemblyTable::new())
    }
    /// Bind, using `table` (perhaps with a custom staleness threshold) for reassembly
    pub fn with_table<A: ToSocketAddrs>(addr: A, table: ReassemblyTable) -> Result<UdpReader> {
        Ok(UdpReader {
            socket: UdpSocket::bind(addr).map_err(Error::transport)?,
            table,
            buf: vec![0; RECV_BUFFER_SIZE],
        })
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::transport)
    }
    /// Bound how long [`poll`](UdpReader::poll) waits for a datagram; `None` waits indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket
            .set_read_timeout(timeout)
            .map_err(Error::transport)
    }
    pub fn stats(&self) -> ReassemblyStats {
        self.table.stats()
    }
    /// Block until a complete message arrives.
    pub fn receive(&mut self) -> Result<Message> {
        loop {
            if let Polled::Message(msg) = self.poll()? {
                return Ok(msg);
            }
        }
    }
    /// Read one datagram. [`Polled::Idle`] means the read timed out; [`Polled::Pending`] means a
    /// datagram was taken but didn't complete a message.
    pub fn poll(&mut self) -> Result<Polled> {
        let n = match self.socket.recv(&mut self.buf) {
            Ok(n) => n,
            Err(err) if would_block(&err) => {
                // Nothing arriving is as good a time as any to sweep out abandoned messages
                self.table.evict_stale(Instant::now());
                return Ok(Polled::Idle);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Polled::Pending),
            Err(err) => return Err(Error::transport(err)),
        };
        let payload = match classify(&self.buf[..n]) {
            Ok(Unit::Whole(payload)) => payload.to_vec(),
            Ok(Unit::Chunk(chunk)) => match self.table.insert(chunk) {
                Some(payload) => payload,
                None => return Ok(Polled::Pending),
            },
            Err(err @ Error::BadChunkHeader { .. }) => {
                warn!(error = %err, length = n, "Dropping malformed GELF chunk.");
                return Ok(Polled::Pending);
            }
            Err(err) => return Err(err),
        };
        decode_payload(&payload).map(Polled::Message)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             stream                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Turns a freshly-accepted TCP connection into something a [`StreamReader`] can read frames
/// from.
///
/// The connection handed back must be non-blocking: the reader services every client from one
/// thread.
pub trait Acceptor: Send + 'static {
    type Conn: Read + Send + 'static;
    fn accept(&self, stream: TcpStream) -> io::Result<Self::Conn>;
    /// The socket underneath `conn`
    fn tcp(conn: &Self::Conn) -> &TcpStream;
}

/// Plain TCP
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainTcp;

impl Acceptor for PlainTcp {
    type Conn = TcpStream;
    fn accept(&self, stream: TcpStream) -> io::Result<TcpStream> {
        stream.set_nonblocking(true)?;
        Ok(stream)
    }
    fn tcp(conn: &TcpStream) -> &TcpStream {
        conn
    }
}

/// How long a client gets to complete its TLS handshake
#[cfg(feature = "tls")]
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS, using an [`SslAcceptor`](openssl::ssl::SslAcceptor) configured (with certificate & key)
/// by the caller.
///
/// The handshake is carried out in blocking mode, bounded by [`HANDSHAKE_TIMEOUT`]; the
/// connection is switched to non-blocking once it completes.
#[cfg(feature = "tls")]
pub struct TlsAcceptor {
    acceptor: openssl::ssl::SslAcceptor,
    timeout: Duration,
}

#[cfg(feature = "tls")]
impl TlsAcceptor {
    pub fn new(acceptor: openssl::ssl::SslAcceptor) -> TlsAcceptor {
        TlsAcceptor {
            acceptor,
            timeout: HANDSHAKE_TIMEOUT,
        }
    }
    pub fn with_timeout(acceptor: openssl::ssl::SslAcceptor, timeout: Duration) -> TlsAcceptor {
        TlsAcceptor { acceptor, timeout }
    }
}

#[cfg(feature = "tls")]
impl Acceptor for TlsAcceptor {
    type Conn = openssl::ssl::SslStream<TcpStream>;
    fn accept(&self, stream: TcpStream) -> io::Result<Self::Conn> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        let tls = self
            .acceptor
            .accept(stream)
            .map_err(|err| io::Error::new(io::ErrorKind::ConnectionAborted, err.to_string()))?;
        tls.get_ref().set_read_timeout(None)?;
        tls.get_ref().set_write_timeout(None)?;
        tls.get_ref().set_nonblocking(true)?;
        Ok(tls)
    }
    fn tcp(conn: &Self::Conn) -> &TcpStream {
        conn.get_ref()
    }
}

struct Connection<C> {
    stream: C,
    peer: SocketAddr,
    decoder: StreamDecoder,
}

/// Receive GELF messages over stream connections
pub struct StreamReader<A: Acceptor = PlainTcp> {
    listener: TcpListener,
    acceptor: A,
    conns: Vec<Connection<A::Conn>>,
    ready: VecDeque<Result<Message>>,
    buf: Vec<u8>,
}

impl StreamReader {
    /// Listen for plain TCP clients on `addr`
    pub fn bind<S: ToSocketAddrs>(addr: S) -> Result<StreamReader> {
        StreamReader::with_acceptor(addr, PlainTcp)
    }
}

#[cfg(feature = "tls")]
impl StreamReader<TlsAcceptor> {
    /// Listen for TLS clients on `addr`
    pub fn tls<S: ToSocketAddrs>(
        addr: S,
        acceptor: openssl::ssl::SslAcceptor,
    ) -> Result<StreamReader<TlsAcceptor>> {
        StreamReader::with_acceptor(addr, TlsAcceptor::new(acceptor))
    }
}

impl<A: Acceptor> StreamReader<A> {
    pub fn with_acceptor<S: ToSocketAddrs>(addr: S, acceptor: A) -> Result<StreamReader<A>> {
        let listener = TcpListener::bind(addr).map_err(Error::transport)?;
        listener.set_nonblocking(true).map_err(Error::transport)?;
        Ok(StreamReader {
            listener,
            acceptor,
            conns: Vec::new(),
            ready: VecDeque::new(),
            buf: vec![0; RECV_BUFFER_SIZE],
        })
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::transport)
    }
    /// Number of open client connections
    pub fn connections(&self) -> usize {
        self.conns.len()
    }
    /// Hang up on every client. Partially-received frames are discarded.
    pub fn drop_connections(&mut self) {
        for conn in self.conns.drain(..) {
            debug!(peer = %conn.peer, "Dropping GELF client connection.");
            let _ = A::tcp(&conn.stream).shutdown(std::net::Shutdown::Both);
        }
    }
    /// Block until a complete message arrives.
    pub fn receive(&mut self) -> Result<Message> {
        loop {
            if let Polled::Message(msg) = self.poll()? {
                return Ok(msg);
            }
        }
    }
    /// Accept pending connections & read whatever has arrived on each. If nothing at all had
    /// arrived, pauses for [`POLL_INTERVAL`] before returning [`Polled::Idle`].
    pub fn poll(&mut self) -> Result<Polled> {
        if let Some(ready) = self.ready.pop_front() {
            return ready.map(Polled::Message);
        }

        let mut busy = self.accept()?;
        let buf = &mut self.buf;
        let ready = &mut self.ready;
        self.conns.retain_mut(|conn| {
            let (alive, read) = pump(conn, buf);
            busy |= read;
            while let Some(msg) = conn.decoder.decode_next() {
                ready.push_back(msg);
            }
            if !alive && conn.decoder.pending() != 0 {
                warn!(
                    peer = %conn.peer,
                    pending = conn.decoder.pending(),
                    "GELF client hung up mid-frame."
                );
            }
            alive
        });

        match self.ready.pop_front() {
            Some(ready) => ready.map(Polled::Message),
            None if busy => Ok(Polled::Pending),
            None => {
                std::thread::sleep(POLL_INTERVAL);
                Ok(Polled::Idle)
            }
        }
    }
    /// Accept all pending connections; true if there were any.
    fn accept(&mut self) -> Result<bool> {
        let mut any = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    any = true;
                    match self.acceptor.accept(stream) {
                        Ok(stream) => {
                            debug!(peer = %peer, "Accepted GELF client connection.");
                            self.conns.push(Connection {
                                stream,
                                peer,
                                decoder: StreamDecoder::new(),
                            });
                        }
                        Err(err) => warn!(
                            peer = %peer,
                            error = %err,
                            "Failed to set up GELF client connection."
                        ),
                    }
                }
                Err(err) if would_block(&err) => return Ok(any),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // A client that vanished between SYN & accept is its own problem
                Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(err) => return Err(Error::transport(err)),
            }
        }
    }
}

/// Drain everything currently readable from `conn` into its decoder. Returns whether the
/// connection is still open & whether anything was read.
fn pump<C: Read>(conn: &mut Connection<C>, buf: &mut [u8]) -> (bool, bool) {
    let mut read = false;
    loop {
        match conn.stream.read(buf) {
            Ok(0) => {
                debug!(peer = %conn.peer, "GELF client disconnected.");
                return (false, read);
            }
            Ok(n) => {
                conn.decoder.extend(&buf[..n]);
                read = true;
            }
            Err(err) if would_block(&err) => return (true, read),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(peer = %conn.peer, error = %err, "Error reading from GELF client.");
                return (false, read);
            }
        }
    }
}
