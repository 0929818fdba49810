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

//! A reader loop on its own thread.
//!
//! [`Listener`] moves a [`UdpReader`] or [`StreamReader`] onto a background thread which reads
//! continuously, forwarding each message (or protocol error) over a channel. The owner steers the
//! loop with [`Signal`]s; each is acknowledged once carried out, so that when
//! [`Listener::stop`] returns, everything the loop had already received is waiting in the channel.

use crate::{
    error::{Error, Result},
    message::Message,
    reader::{Acceptor, Polled, StreamReader, UdpReader},
};

use backtrace::Backtrace;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error};

use std::{net::SocketAddr, thread::JoinHandle, time::Duration};

/// How long one read may block before the loop checks for signals
const SIGNAL_INTERVAL: Duration = Duration::from_millis(50);

/// Instructions to the reader loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Finish reading what has arrived, then exit
    Stop,
    /// Hang up on all stream clients (no effect on UDP)
    DropConnections,
}

/// Acknowledgement that a [`Signal`] has been carried out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Done,
}

/// Why the reader loop exited
#[derive(Debug)]
pub enum Shutdown {
    /// On request
    Stopped,
    /// The socket failed
    SocketError(Error),
    /// The loop panicked
    Panicked,
}

/// What the loop needs from a reader
trait Source: Send + 'static {
    fn poll(&mut self) -> Result<Polled>;
    fn drop_connections(&mut self) {}
}

impl Source for UdpReader {
    fn poll(&mut self) -> Result<Polled> {
        UdpReader::poll(self)
    }
}

impl<A: Acceptor> Source for StreamReader<A> {
    fn poll(&mut self) -> Result<Polled> {
        StreamReader::poll(self)
    }
    fn drop_connections(&mut self) {
        StreamReader::drop_connections(self)
    }
}

/// Forward one poll result; `Some` means the loop must exit.
fn forward(result: Result<Polled>, messages: &Sender<Result<Message>>) -> Option<Shutdown> {
    match result {
        Ok(Polled::Message(msg)) => {
            let _ = messages.send(Ok(msg));
            None
        }
        Ok(Polled::Pending) | Ok(Polled::Idle) => None,
        Err(err) if err.is_protocol() => {
            debug!(error = %err, "Undecodable GELF message.");
            let _ = messages.send(Err(err));
            None
        }
        Err(err) => {
            error!(error = %err, "GELF listener socket failed.");
            Some(Shutdown::SocketError(err))
        }
    }
}

fn run<S: Source>(
    mut source: S,
    signals: Receiver<Signal>,
    acks: Sender<Ack>,
    messages: Sender<Result<Message>>,
) -> Shutdown {
    loop {
        match signals.try_recv() {
            Ok(Signal::Stop) | Err(TryRecvError::Disconnected) => {
                // Drain until the socket is idle before saying we're done
                loop {
                    match source.poll() {
                        Ok(Polled::Idle) => break,
                        result => {
                            if let Some(shutdown) = forward(result, &messages) {
                                let _ = acks.send(Ack::Done);
                                return shutdown;
                            }
                        }
                    }
                }
                let _ = acks.send(Ack::Done);
                return Shutdown::Stopped;
            }
            Ok(Signal::DropConnections) => {
                source.drop_connections();
                let _ = acks.send(Ack::Done);
            }
            Err(TryRecvError::Empty) => (),
        }
        if let Some(shutdown) = forward(source.poll(), &messages) {
            return shutdown;
        }
    }
}

/// A reader running on a background thread
pub struct Listener {
    local_addr: SocketAddr,
    signals: Sender<Signal>,
    acks: Receiver<Ack>,
    messages: Receiver<Result<Message>>,
    handle: Option<JoinHandle<Shutdown>>,
}

impl Listener {
    pub fn spawn_udp(reader: UdpReader) -> Result<Listener> {
        reader.set_read_timeout(Some(SIGNAL_INTERVAL))?;
        let local_addr = reader.local_addr()?;
        Listener::spawn(reader, local_addr)
    }
    pub fn spawn_stream<A: Acceptor>(reader: StreamReader<A>) -> Result<Listener> {
        let local_addr = reader.local_addr()?;
        Listener::spawn(reader, local_addr)
    }
    fn spawn<S: Source>(source: S, local_addr: SocketAddr) -> Result<Listener> {
        let (signal_tx, signal_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        let (msg_tx, msg_rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("gelf-listener-{}", local_addr))
            .spawn(move || run(source, signal_rx, ack_tx, msg_tx))
            .map_err(Error::transport)?;
        debug!(local_addr = %local_addr, "Spawned GELF listener.");
        Ok(Listener {
            local_addr,
            signals: signal_tx,
            acks: ack_rx,
            messages: msg_rx,
            handle: Some(handle),
        })
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Block for the next message. `None` once the loop has exited & every message it produced
    /// has been taken.
    pub fn recv(&self) -> Option<Result<Message>> {
        self.messages.recv().ok()
    }
    /// Like [`recv`](Listener::recv), but give up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<Message>> {
        match self.messages.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
    /// Send `signal` & wait for the loop to acknowledge it.
    fn signal(&self, signal: Signal) -> Result<Ack> {
        let closed = || Error::Closed {
            back: Backtrace::new(),
        };
        self.signals.send(signal).map_err(|_| closed())?;
        self.acks.recv().map_err(|_| closed())
    }
    /// Hang up on all stream clients; returns once they've been dropped.
    pub fn drop_connections(&self) -> Result<()> {
        self.signal(Signal::DropConnections).map(|_| ())
    }
    /// Stop the loop, waiting for it to finish reading. Messages it received remain available
    /// through [`recv`](Listener::recv).
    pub fn stop(&mut self) -> Shutdown {
        let _ = self.signal(Signal::Stop);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(Shutdown::Panicked),
            None => Shutdown::Stopped,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}
