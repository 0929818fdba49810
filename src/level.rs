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

//! GELF severity levels.
//!
//! GELF borrows its `level` field wholesale from syslog: the value is one of the eight severities
//! documented in the `syslog()` manual [page] & `<syslog.h>`, transmitted as a bare integer.
//!
//! [page]: https://man7.org/linux/man-pages/man3/syslog.3.html

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

type StdResult<T, E> = std::result::Result<T, E>;

/// The eight syslog severity levels. The enumeration values duplicate the constants defined in
/// `<syslog.h>`, which is also what goes out on the wire.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// system is unusable
    LOG_EMERG = 0,
    /// action must be take immediately
    LOG_ALERT = 1,
    /// critical conditions
    LOG_CRIT = 2,
    /// error conditions
    LOG_ERR = 3,
    /// warning conditions
    LOG_WARNING = 4,
    /// normal, but significant condition
    LOG_NOTICE = 5,
    /// informational message
    #[default]
    LOG_INFO = 6,
    /// debug-level message
    LOG_DEBUG = 7,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> StdResult<(), std::fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Level::LOG_EMERG => "LOG_EMERG",
                Level::LOG_ALERT => "LOG_ALERT",
                Level::LOG_CRIT => "LOG_CRIT",
                Level::LOG_ERR => "LOG_ERR",
                Level::LOG_WARNING => "LOG_WARNING",
                Level::LOG_NOTICE => "LOG_NOTICE",
                Level::LOG_INFO => "LOG_INFO",
                Level::LOG_DEBUG => "LOG_DEBUG",
            }
        )
    }
}

impl std::convert::TryFrom<u64> for Level {
    type Error = u64;
    fn try_from(x: u64) -> StdResult<Self, Self::Error> {
        match x {
            0 => Ok(Level::LOG_EMERG),
            1 => Ok(Level::LOG_ALERT),
            2 => Ok(Level::LOG_CRIT),
            3 => Ok(Level::LOG_ERR),
            4 => Ok(Level::LOG_WARNING),
            5 => Ok(Level::LOG_NOTICE),
            6 => Ok(Level::LOG_INFO),
            7 => Ok(Level::LOG_DEBUG),
            x => Err(x),
        }
    }
}

/// The default mapping from [`tracing`] verbosity to syslog severity.
///
/// [`tracing`]: https://docs.rs/tracing/latest/tracing/index.html
impl std::convert::From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Level::LOG_DEBUG,
            tracing::Level::INFO => Level::LOG_INFO,
            tracing::Level::WARN => Level::LOG_WARNING,
            tracing::Level::ERROR => Level::LOG_ERR,
        }
    }
}

impl Serialize for Level {
    fn serialize<S: Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> StdResult<Self, D::Error> {
        let x = u64::deserialize(deserializer)?;
        Level::try_from(x).map_err(|x| {
            de::Error::invalid_value(de::Unexpected::Unsigned(x), &"a syslog level in 0..=7")
        })
    }
}

#[cfg(test)]
mod level_tests {
    use super::*;

    #[test]
    fn test_level() {
        assert_eq!(6, Level::LOG_INFO as u8);
        assert_eq!(format!("{}", Level::LOG_ERR), "LOG_ERR".to_string());
        assert_eq!(Level::try_from(4u64), Ok(Level::LOG_WARNING));
        assert_eq!(Level::try_from(8u64), Err(8));
        assert_eq!(Level::from(&tracing::Level::TRACE), Level::LOG_DEBUG);
        assert_eq!(Level::from(&tracing::Level::WARN), Level::LOG_WARNING);
    }

    #[test]
    fn test_serde() {
        assert_eq!(serde_json::to_string(&Level::LOG_ALERT).unwrap(), "1");
        let x: Level = serde_json::from_str("7").unwrap();
        assert_eq!(x, Level::LOG_DEBUG);
        assert!(serde_json::from_str::<Level>("9").is_err());
    }
}
