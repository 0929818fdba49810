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

//! Sending & receiving [GELF] messages, with a [`tracing-subscriber`] [`Layer`] on top.
//!
//! [GELF]: https://go2docs.graylog.org/current/getting_in_log_data/gelf.html
//! [`tracing-subscriber`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/index.html
//! [`Layer`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/trait.Layer.html
//!
//! # Introduction
//!
//! GELF, the Graylog Extended Log Format, is a JSON log record with a handful of required fields
//! (`version`, `host`, `short_message`) and any number of "additional" fields whose names begin
//! with an underscore. On the wire, the record is always compressed (gzip or zlib) and then
//! either:
//!
//! - sent as a UDP datagram, split into at most 128 [chunks](chunk) if it won't fit in one; or
//! - written to a TCP (or TLS) stream, terminated by a single `0x00` byte.
//!
//! This crate implements both sides of both transports:
//!
//! - [`message`]: the record itself, its JSON form & the rules for additional fields
//! - [`compression`], [`chunk`], [`codec`]: getting a record into (and out of) wire format
//! - [`reassembly`]: putting chunked messages back together on the receiving end
//! - [`transport`]: the [`Transport`](transport::Transport) trait & the UDP writer
//! - [`stream`]: the TCP/TLS writer, which reconnects when its connection fails
//! - [`reader`] & [`listener`]: receiving messages, directly or on a background thread
//! - [`layer`]: a [`tracing-subscriber`] [`Layer`] shipping [`tracing`] events as GELF
//!
//! [`tracing`]: https://docs.rs/tracing/latest/tracing/index.html
//!
//! # Usage
//!
//! The [`Layer`](layer::Layer) comes with sane defaults:
//!
//! ```rust
//! use tracing::info;
//! use tracing_gelf::layer::Layer;
//! use tracing_subscriber::registry::Registry;
//! use tracing_subscriber::layer::SubscriberExt; // Needed to get `with()`
//!
//! // The default configuration is to send gzip'd GELF messages via UDP to port 12201 on the
//! // localhost.
//! let subscriber = Registry::default().with(Layer::try_default().unwrap());
//!
//! info!(user = "sp1ff", "Hello, world!");
//! ```
//!
//! The transport is configurable:
//!
//! ```no_run
//! use tracing::info;
//! use tracing_gelf::{layer::Layer, stream::StreamWriter};
//! use tracing_subscriber::registry::Registry;
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! let subscriber = Registry::default().with(Layer::with_transport(
//!     StreamWriter::tcp("graylog.local:12201").unwrap()));
//!
//! info!("Hello, world!");
//! ```
//!
//! Receiving is just as simple:
//!
//! ```no_run
//! use tracing_gelf::reader::UdpReader;
//!
//! let mut reader = UdpReader::bind("0.0.0.0:12201").unwrap();
//! loop {
//!     match reader.receive() {
//!         Ok(msg) => println!("{}: {}", msg.host(), msg.short()),
//!         Err(err) if err.is_protocol() => eprintln!("bad message: {}", err),
//!         Err(err) => panic!("{}", err),
//!     }
//! }
//! ```

pub mod chunk;
pub mod codec;
pub mod compression;
pub mod error;
pub mod host;
pub mod layer;
pub mod level;
pub mod listener;
pub mod message;
pub mod reader;
pub mod reassembly;
pub mod stream;
pub mod transport;
