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

//! Listen for GELF on port 12201 (UDP & TCP) on the local host, printing whatever arrives.
//!
//! Run this, then `udp-test` or `tcp-test`, in another terminal.

use tracing_gelf::{
    listener::Listener,
    reader::{StreamReader, UdpReader},
    transport::DEFAULT_PORT,
};

use std::time::Duration;

pub fn main() {
    let udp = Listener::spawn_udp(UdpReader::bind(("127.0.0.1", DEFAULT_PORT)).unwrap()).unwrap();
    let tcp =
        Listener::spawn_stream(StreamReader::bind(("127.0.0.1", DEFAULT_PORT)).unwrap()).unwrap();

    loop {
        for (proto, listener) in [("udp", &udp), ("tcp", &tcp)] {
            match listener.recv_timeout(Duration::from_millis(100)) {
                Some(Ok(msg)) => println!(
                    "[{}] {} {} {}: {}",
                    proto,
                    msg.timestamp(),
                    msg.host(),
                    msg.level(),
                    msg.short()
                ),
                Some(Err(err)) => eprintln!("[{}] {}", proto, err),
                None => (),
            }
        }
    }
}
