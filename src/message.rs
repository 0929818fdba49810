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

//! The GELF message model.
//!
//! # Introduction
//!
//! A GELF [message] is a flat JSON object. A handful of keys are defined by the format itself
//! (`version`, `host`, `short_message`, `full_message`, `timestamp`, `level` & the deprecated
//! `facility`); everything else the sender wishes to attach must be an "additional field" whose
//! key begins with an underscore.
//!
//! [message]: https://go2docs.graylog.org/current/getting_in_log_data/gelf.html
//!
//! [`Message`] is built once per log event, is immutable thereafter, and is handed off to the
//! codec to be serialized, compressed & sent.
//!
//! # Additional fields
//!
//! [`MessageBuilder::field`] takes care of the underscore: `field("user", ...)` and
//! `field("_user", ...)` both produce `_user`. When a caller-supplied key collides with a reserved
//! field name the reserved field wins: the builder refuses the key outright
//! ([`Error::ReservedField`]). The raw-JSON escape hatch ([`MessageBuilder::raw_extra`]) can't be
//! checked up-front, so there the reserved (and explicitly set) fields silently override it at
//! serialization time. The call site travels as `_file` & `_line`.

use crate::{
    error::{Error, Result},
    level::Level,
};

use backtrace::Backtrace;
use chrono::prelude::*;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use std::collections::BTreeMap;

type StdResult<T, E> = std::result::Result<T, E>;

/// The version of the GELF specification we speak.
pub const GELF_VERSION: &str = "1.1";

pub mod fields {
    pub const VERSION: &str = "version";
    pub const HOST: &str = "host";
    pub const SHORT_MESSAGE: &str = "short_message";
    pub const FULL_MESSAGE: &str = "full_message";
    pub const TIMESTAMP: &str = "timestamp";
    pub const LEVEL: &str = "level";
    pub const FACILITY: &str = "facility";
    pub const FILE: &str = "_file";
    pub const LINE: &str = "_line";

    /// Field names an additional field may never take
    pub const RESERVED: [&str; 9] = [
        VERSION,
        HOST,
        SHORT_MESSAGE,
        FULL_MESSAGE,
        TIMESTAMP,
        LEVEL,
        FACILITY,
        "id",
        "_id",
    ];
}

/// A single GELF log event.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    version: String,
    host: String,
    short: String,
    full: Option<String>,
    timestamp: f64,
    level: Level,
    facility: Option<String>,
    file: Option<String>,
    line: Option<u32>,
    additional: BTreeMap<String, Value>,
    raw_extra: Option<Map<String, Value>>,
}

/// Render a point in time the way GELF likes it: seconds since the epoch, with microseconds after
/// the decimal point.
pub fn gelf_timestamp(t: DateTime<Utc>) -> f64 {
    t.timestamp() as f64 + f64::from(t.timestamp_subsec_micros()) / 1_000_000.0
}

/// Split free-form text into the short & (optional) full messages.
///
/// Trailing line endings are removed. Single-line text becomes the short message alone; otherwise
/// the first non-empty line is the short message & the entire text the full message.
fn split_text(text: &str) -> Result<(String, Option<String>)> {
    let text = text.trim_end_matches(['\n', '\r']);
    if text.is_empty() {
        return Err(Error::EmptyMessage {
            back: Backtrace::new(),
        });
    }
    if text.contains('\n') {
        let short = text.lines().find(|l| !l.is_empty()).unwrap_or(text);
        Ok((short.to_owned(), Some(text.to_owned())))
    } else {
        Ok((text.to_owned(), None))
    }
}

/// Normalize a caller-supplied additional field name to its wire form (leading underscore).
fn field_key(name: &str) -> Result<String> {
    if fields::RESERVED.contains(&name) {
        return Err(Error::ReservedField {
            name: name.to_owned(),
            back: Backtrace::new(),
        });
    }
    let bare = name.strip_prefix('_').unwrap_or(name);
    if bare.is_empty()
        || !bare
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::BadFieldName {
            name: name.to_owned(),
            back: Backtrace::new(),
        });
    }
    Ok(format!("_{}", bare))
}

impl Message {
    /// Start building a message from `host` & a short message.
    pub fn builder<H: Into<String>, S: Into<String>>(host: H, short: S) -> MessageBuilder {
        MessageBuilder {
            imp: Message {
                version: GELF_VERSION.to_owned(),
                host: host.into(),
                short: short.into(),
                full: None,
                timestamp: f64::NAN,
                level: Level::default(),
                facility: None,
                file: None,
                line: None,
                additional: BTreeMap::new(),
                raw_extra: None,
            },
        }
    }
    /// Start building a message from free-form (perhaps multi-line) text.
    ///
    /// ```rust
    /// use tracing_gelf::message::Message;
    /// let msg = Message::from_text("bree", "awesomesauce\nbananas").unwrap().build().unwrap();
    /// assert_eq!(msg.short(), "awesomesauce");
    /// assert_eq!(msg.full(), "awesomesauce\nbananas");
    /// ```
    pub fn from_text<H: Into<String>>(host: H, text: &str) -> Result<MessageBuilder> {
        let (short, full) = split_text(text)?;
        let mut builder = Message::builder(host, short);
        builder.imp.full = full;
        Ok(builder)
    }
    pub fn version(&self) -> &str {
        &self.version
    }
    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn short(&self) -> &str {
        &self.short
    }
    /// The full message, or the empty string if there is none
    pub fn full(&self) -> &str {
        self.full.as_deref().unwrap_or("")
    }
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }
    pub fn level(&self) -> Level {
        self.level
    }
    pub fn facility(&self) -> Option<&str> {
        self.facility.as_deref()
    }
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }
    pub fn line(&self) -> Option<u32> {
        self.line
    }
    /// Additional fields, keyed by their wire names (i.e. with the leading underscore)
    pub fn additional(&self) -> &BTreeMap<String, Value> {
        &self.additional
    }
    /// Look up an additional field, with or without its leading underscore
    pub fn field(&self, name: &str) -> Option<&Value> {
        let bare = name.strip_prefix('_').unwrap_or(name);
        self.additional.get(&format!("_{}", bare))
    }
    /// Serialize to the GELF JSON document
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
    /// Deserialize from a GELF JSON document
    pub fn from_json(buf: &[u8]) -> Result<Message> {
        Ok(serde_json::from_slice(buf)?)
    }

    fn to_map(&self) -> Map<String, Value> {
        // Lowest precedence first: later inserts overwrite earlier ones.
        let mut map = Map::new();
        if let Some(raw) = &self.raw_extra {
            // raw keys go out as additional fields, underscore and all
            for (k, v) in raw {
                if let Ok(key) = field_key(k) {
                    map.insert(key, v.clone());
                }
            }
        }
        for (k, v) in &self.additional {
            map.insert(k.clone(), v.clone());
        }
        if let Some(file) = &self.file {
            map.insert(fields::FILE.to_owned(), Value::from(file.clone()));
        }
        if let Some(line) = self.line {
            map.insert(fields::LINE.to_owned(), Value::from(line));
        }
        map.insert(fields::VERSION.to_owned(), Value::from(self.version.clone()));
        map.insert(fields::HOST.to_owned(), Value::from(self.host.clone()));
        map.insert(fields::SHORT_MESSAGE.to_owned(), Value::from(self.short.clone()));
        if let Some(full) = &self.full {
            map.insert(fields::FULL_MESSAGE.to_owned(), Value::from(full.clone()));
        }
        map.insert(fields::TIMESTAMP.to_owned(), Value::from(self.timestamp));
        map.insert(fields::LEVEL.to_owned(), Value::from(self.level as u8));
        if let Some(facility) = &self.facility {
            map.insert(fields::FACILITY.to_owned(), Value::from(facility.clone()));
        }
        map
    }

    fn from_map(mut map: Map<String, Value>) -> StdResult<Message, String> {
        fn take_string(map: &mut Map<String, Value>, key: &str) -> StdResult<Option<String>, String> {
            match map.remove(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s)),
                Some(other) => Err(format!("'{}' should be a string, not {}", key, other)),
            }
        }
        let required = |x: Option<String>, key: &str| x.ok_or_else(|| format!("missing '{}'", key));

        let version = required(take_string(&mut map, fields::VERSION)?, fields::VERSION)?;
        let host = required(take_string(&mut map, fields::HOST)?, fields::HOST)?;
        let short = required(
            take_string(&mut map, fields::SHORT_MESSAGE)?,
            fields::SHORT_MESSAGE,
        )?;
        let full = take_string(&mut map, fields::FULL_MESSAGE)?.filter(|s| !s.is_empty());
        let facility = take_string(&mut map, fields::FACILITY)?;

        let timestamp = match map.remove(fields::TIMESTAMP) {
            None | Some(Value::Null) => gelf_timestamp(Utc::now()),
            Some(Value::Number(n)) => n.as_f64().ok_or("unrepresentable timestamp")?,
            Some(other) => return Err(format!("'timestamp' should be a number, not {}", other)),
        };
        // GELF defines a missing level as ALERT.
        let level = match map.remove(fields::LEVEL) {
            None | Some(Value::Null) => Level::LOG_ALERT,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|x| Level::try_from(x).ok())
                .ok_or_else(|| format!("{} is not a syslog level", n))?,
            Some(other) => return Err(format!("'level' should be a number, not {}", other)),
        };

        // GELF 1.0 senders put the call site in top-level "file" & "line" fields; accept either
        // spelling.
        let mut file = None;
        let mut line = None;
        for key in [fields::FILE, "file"] {
            if let Some(Value::String(s)) = map.get(key) {
                file = Some(s.clone());
                map.remove(key);
                break;
            }
        }
        for key in [fields::LINE, "line"] {
            if let Some(n) = map.get(key).and_then(Value::as_u64) {
                line = u32::try_from(n).ok();
                map.remove(key);
                break;
            }
        }

        let additional = map
            .into_iter()
            .filter(|(k, _)| k.starts_with('_'))
            .collect::<BTreeMap<String, Value>>();

        Ok(Message {
            version,
            host,
            short,
            full,
            timestamp,
            level,
            facility,
            file,
            line,
            additional,
            raw_extra: None,
        })
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> StdResult<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Message::from_map(map).map_err(de::Error::custom)
    }
}

/// Incrementally configure a [`Message`]
#[derive(Clone, Debug)]
pub struct MessageBuilder {
    imp: Message,
}

impl MessageBuilder {
    pub fn full<S: Into<String>>(mut self, full: S) -> Self {
        let full = full.into();
        self.imp.full = if full.is_empty() { None } else { Some(full) };
        self
    }
    /// Seconds since the Unix epoch; defaults to "now" at [`build`](MessageBuilder::build) time
    pub fn timestamp(mut self, timestamp: f64) -> Self {
        self.imp.timestamp = timestamp;
        self
    }
    pub fn timestamp_from(self, t: DateTime<Utc>) -> Self {
        self.timestamp(gelf_timestamp(t))
    }
    pub fn level(mut self, level: Level) -> Self {
        self.imp.level = level;
        self
    }
    pub fn facility<S: Into<String>>(mut self, facility: S) -> Self {
        self.imp.facility = Some(facility.into());
        self
    }
    /// Record the source location that produced this message
    pub fn call_site<S: Into<String>>(mut self, file: S, line: u32) -> Self {
        self.imp.file = Some(file.into());
        self.imp.line = Some(line);
        self
    }
    /// Attach an additional field; `value` must be a string, number or boolean.
    pub fn field<V: Into<Value>>(mut self, name: &str, value: V) -> Result<Self> {
        self.add_field(name, value)?;
        Ok(self)
    }
    /// Like [`field`](MessageBuilder::field), but in place; on error, the builder is unchanged.
    pub fn add_field<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<()> {
        let key = field_key(name)?;
        let value = value.into();
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                self.imp.additional.insert(key, value);
                Ok(())
            }
            _ => Err(Error::BadFieldValue {
                name: name.to_owned(),
                back: Backtrace::new(),
            }),
        }
    }
    /// Merge a raw JSON object into the message at serialization time
    pub fn raw_extra(mut self, json: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(map) => {
                self.imp.raw_extra = Some(map);
                Ok(self)
            }
            other => Err(Error::BadMessage {
                reason: format!("raw extra fields must be a JSON object, not {}", other),
                back: Backtrace::new(),
            }),
        }
    }
    pub fn build(mut self) -> Result<Message> {
        if self.imp.short.is_empty() {
            return Err(Error::EmptyMessage {
                back: Backtrace::new(),
            });
        }
        if self.imp.timestamp.is_nan() {
            self.imp.timestamp = gelf_timestamp(Utc::now());
        }
        Ok(self.imp)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_text() {
        let msg = Message::from_text("bree", "awesomesauce\nbananas")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(msg.short(), "awesomesauce");
        assert_eq!(msg.full(), "awesomesauce\nbananas");

        let msg = Message::from_text("bree", "some awesome thing\n")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(msg.short(), "some awesome thing");
        assert_eq!(msg.full(), "");

        let msg = Message::from_text("bree", "\n\nfirst real line\nsecond\r\n")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(msg.short(), "first real line");
        assert_eq!(msg.full(), "\n\nfirst real line\nsecond");

        assert!(Message::from_text("bree", "\n\n").is_err());
        assert!(Message::builder("bree", "").build().is_err());
    }

    #[test]
    fn test_reserved_fields() {
        // Reserved names are refused outright...
        for name in ["host", "version", "short_message", "timestamp", "level", "id", "_id"] {
            match Message::builder("bree", "hi").field(name, "x") {
                Err(Error::ReservedField { name: n, .. }) => assert_eq!(n, name),
                _ => panic!("{} should have been refused", name),
            }
        }
        // but an underscored variant of a reserved name is just an additional field.
        let msg = Message::builder("bree", "hi")
            .field("_host", "elsewhere")
            .unwrap()
            .build()
            .unwrap();
        let json: Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["host"], "bree");
        assert_eq!(json["_host"], "elsewhere");

        // Raw extras lose to reserved & explicitly set fields.
        let msg = Message::builder("bree", "hi")
            .field("a", 1)
            .unwrap()
            .raw_extra(
                r#"{"host": "mallory", "_a": 2, "_b": true, "woo": "hoo", "a b": 3, "_id": 4}"#,
            )
            .unwrap()
            .build()
            .unwrap();
        let json: Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["host"], "bree");
        assert_eq!(json["_a"], 1);
        assert_eq!(json["_b"], true);
        // Bare raw keys become additional fields; names GELF won't take are dropped
        assert_eq!(json["_woo"], "hoo");
        let keys = json.as_object().unwrap();
        assert!(!keys.contains_key("woo"));
        assert!(!keys.contains_key("a b"));
        assert!(!keys.contains_key("_a b"));
        assert!(!keys.contains_key("_id"));
    }

    #[test]
    fn test_field_validation() {
        assert!(Message::builder("bree", "hi").field("a b", 1).is_err());
        assert!(Message::builder("bree", "hi").field("_", 1).is_err());
        assert!(Message::builder("bree", "hi")
            .field("list", Value::Array(vec![]))
            .is_err());
        assert!(Message::builder("bree", "hi").field("nothing", Value::Null).is_err());
        let msg = Message::builder("bree", "hi")
            .field("user.name", "sp1ff")
            .unwrap()
            .field("_elapsed-ms", 12.5)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(msg.field("user.name"), Some(&Value::from("sp1ff")));
        assert_eq!(msg.field("_elapsed-ms"), Some(&Value::from(12.5)));
    }

    #[test]
    fn test_add_field_in_place() {
        let mut builder = Message::builder("bree", "hi");
        builder.add_field("a", 1).unwrap();
        assert!(matches!(
            builder.add_field("host", "mallory"),
            Err(Error::ReservedField { .. })
        ));
        assert!(matches!(
            builder.add_field("b", Value::Null),
            Err(Error::BadFieldValue { .. })
        ));
        builder.add_field("c", true).unwrap();
        let msg = builder.build().unwrap();
        assert_eq!(msg.host(), "bree");
        assert_eq!(msg.additional().len(), 2);
        assert_eq!(msg.field("a"), Some(&Value::from(1)));
        assert_eq!(msg.field("c"), Some(&Value::from(true)));
    }

    #[test]
    fn test_json() {
        let msg = Message::builder("bree", "quick")
            .full("quick\nwith more detail")
            .timestamp(1_650_000_000.25)
            .level(Level::LOG_INFO)
            .facility("writer_test")
            .call_site("src/message.rs", 42)
            .field("a", 16_500_000_000i64)
            .unwrap()
            .raw_extra(r#"{"woo": "hoo"}"#)
            .unwrap()
            .build()
            .unwrap();

        let json: Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["version"], "1.1");
        assert_eq!(json["short_message"], "quick");
        assert_eq!(json["full_message"], "quick\nwith more detail");
        assert_eq!(json["timestamp"], 1_650_000_000.25);
        assert_eq!(json["level"], 6);
        assert_eq!(json["_file"], "src/message.rs");
        assert_eq!(json["_line"], 42);

        let back = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back.short(), "quick");
        assert_eq!(back.full(), "quick\nwith more detail");
        assert_eq!(back.level(), Level::LOG_INFO);
        assert_eq!(back.facility(), Some("writer_test"));
        assert_eq!(back.file(), Some("src/message.rs"));
        assert_eq!(back.line(), Some(42));
        assert_eq!(back.field("a"), Some(&Value::from(16_500_000_000i64)));
        assert_eq!(back.field("woo"), Some(&Value::from("hoo")));
        assert_eq!(back.additional().len(), 2);
    }

    #[test]
    fn test_lenient_decode() {
        let msg = Message::from_json(
            br#"{"version":"1.0","host":"h","short_message":"s","file":"a.go","line":7}"#,
        )
        .unwrap();
        assert_eq!(msg.level(), Level::LOG_ALERT);
        assert_eq!(msg.file(), Some("a.go"));
        assert_eq!(msg.line(), Some(7));
        assert!(msg.timestamp() > 0.0);

        assert!(Message::from_json(br#"{"version":"1.1","host":"h"}"#).is_err());
        assert!(Message::from_json(br#"{"version":"1.1","host":"h","short_message":"s","level":9}"#).is_err());
        assert!(Message::from_json(b"[1, 2]").is_err());
    }
}
