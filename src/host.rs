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

//! Host identity.
//!
//! Every GELF message names the host that sent it. Rather than reach out to the operating system
//! each time a message is built, writers take a [`HostnameProvider`] at construction time &
//! consult it once. Tests can pass a [`StaticHostname`] for deterministic output.

use crate::error::{Error, Result};

use backtrace::Backtrace;

type StdResult<T, E> = std::result::Result<T, E>;

/// Produce the `host` field for outgoing messages.
pub trait HostnameProvider {
    fn hostname(&self) -> Result<String>;
}

/// Ask the operating system for this host's name, falling back to a local IP address.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHostname;

impl HostnameProvider for SystemHostname {
    fn hostname(&self) -> Result<String> {
        // `hostname::get()` returns an `Result<OsString,_>`, which is really kind of a hassle to
        // work with...
        hostname::get()
            .map_err(|err| Error::NoHostname {
                source: Box::new(err),
                back: Backtrace::new(),
            })
            .map(|hn| hn.to_string_lossy().into_owned())
            .and_then(|hn| {
                if hn.is_empty() {
                    Err(Error::NoHostname {
                        source: "the operating system reported an empty hostname".into(),
                        back: Backtrace::new(),
                    })
                } else {
                    Ok(hn)
                }
            })
            // 👇 will return the Ok(String), or call the closure :=> StdResult<String, Error>
            .or_else(|_err| {
                let ip: StdResult<std::net::IpAddr, Error> =
                    local_ip_address::local_ip().map_err(|err| Error::NoHostname {
                        source: Box::new(err),
                        back: Backtrace::new(),
                    });
                ip.map(|ip| ip.to_string())
            })
    }
}

/// A fixed hostname.
#[derive(Clone, Debug)]
pub struct StaticHostname(pub String);

impl HostnameProvider for StaticHostname {
    fn hostname(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

impl<F> HostnameProvider for F
where
    F: Fn() -> Result<String>,
{
    fn hostname(&self) -> Result<String> {
        self()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_providers() {
        let _x = SystemHostname.hostname(); // At least _exercise_ it
        assert_eq!(
            StaticHostname("bree.local".to_owned()).hostname().unwrap(),
            "bree.local"
        );
        let f = || -> Result<String> { Ok("rivendell".to_owned()) };
        assert_eq!(f.hostname().unwrap(), "rivendell");
    }
}
