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

//! [tracing-gelf](crate) [`Layer`] implementation.
//!
//! [`Layer`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/trait.Layer.html
//!
//! Each [`Event`] becomes one GELF [`Message`]: the `message` field supplies the short (and, for
//! multi-line text, the full) message, the event's level maps onto a syslog severity, and every
//! other field becomes an additional field with its JSON type preserved. Fields whose names GELF
//! won't accept (`host`, `id` & the like) are skipped.
//!
//! Events emitted while the layer is itself busy shipping an event (a transport logging its own
//! reconnect attempts, say) are not forwarded; on that thread, the layer is not re-entrant.
//!
//! [`Event`]: https://docs.rs/tracing/0.1.35/tracing/struct.Event.html

use crate::{
    level::Level,
    message::Message,
    transport::{Transport, UdpWriter},
};

use backtrace::Backtrace;
use serde_json::Value;
use tracing::Event;
use tracing_subscriber::layer::Context;

use std::cell::Cell;

// When the tracing-log feature is enabled, use NormalizeEvent to recover file/line metadata from
// events that originated from the `log` crate.
#[cfg(feature = "tracing-log")]
use tracing_log::NormalizeEvent;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// module error type
#[non_exhaustive]
pub enum Error {
    /// The event carried no `message` field
    NoMessageField { name: &'static str, back: Backtrace },
    /// The event couldn't be turned into a GELF message
    Message {
        source: crate::error::Error,
        back: Backtrace,
    },
    /// Transport layer error
    Transport {
        source: crate::error::Error,
        back: Backtrace,
    },
}

impl std::fmt::Display for Error {
    // `Error` is non-exhaustive so that adding variants won't be a breaking change to our
    // callers. That means the compiler won't catch us if we miss a variant here, so we
    // always include a `_` arm.
    #[allow(unreachable_patterns)]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NoMessageField { name, .. } => {
                write!(f, "No message field found in event {}", name)
            }
            Error::Message { source, .. } => {
                write!(f, "While building a GELF message, got {}", source)
            }
            Error::Transport { source, .. } => {
                write!(f, "While sending a GELF message, got {}", source)
            }
            _ => write!(f, "GELF layer error"),
        }
    }
}

impl std::fmt::Debug for Error {
    #[allow(unreachable_patterns)]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NoMessageField { back, .. } => write!(f, "{}\n{:#?}", self, back),
            Error::Message { back, .. } => write!(f, "{}\n{:#?}", self, back),
            Error::Transport { back, .. } => write!(f, "{}\n{:#?}", self, back),
            _ => write!(f, "{}", self),
        }
    }
}

impl std::error::Error for Error {
    #[allow(unreachable_patterns)]
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Message { source, .. } | Error::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         field visitor                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(&'static str, Value)>,
}

impl FieldVisitor {
    fn record(&mut self, field: &tracing::field::Field, value: Value) {
        // tracing-log smuggles the `log` record's metadata in as fields; it's recovered via
        // normalized metadata instead.
        #[cfg(feature = "tracing-log")]
        if field.name().starts_with("log.") {
            return;
        }
        self.fields.push((field.name(), value));
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.record(field, Value::from(value));
    }
    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.record(field, Value::from(value));
    }
    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.record(field, Value::from(value));
    }
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.record(field, Value::from(value));
    }
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_owned());
        } else {
            self.record(field, Value::from(value));
        }
    }
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        // The tracing macros "pre-format" the `message` field, so `value` is really a
        // `std::fmt::Arguments` whose debug format has no enclosing quotes.
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.record(field, Value::from(format!("{:?}", value)));
        }
    }
}

thread_local! {
    static SHIPPING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as busy shipping an event until dropped
struct Shipping;

impl Shipping {
    /// None if this thread is already shipping an event
    fn enter() -> Option<Shipping> {
        if SHIPPING.with(|busy| busy.replace(true)) {
            None
        } else {
            Some(Shipping)
        }
    }
}

impl Drop for Shipping {
    fn drop(&mut self) {
        SHIPPING.with(|busy| busy.set(false));
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          struct Layer                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [`tracing-subscriber`]-compliant [`Layer`] implementation that will send [`Event`]s to a
/// GELF collector over any [`Transport`].
///
/// [`tracing-subscriber`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/index.html
/// [`Layer`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/trait.Layer.html
/// [`Event`]: https://docs.rs/tracing/0.1.35/tracing/struct.Event.html
pub struct Layer<T: Transport> {
    transport: T,
    facility: Option<String>,
    with_target: bool,
}

impl Layer<UdpWriter> {
    /// Attempt to construct a [`Layer`] that will send GELF messages via UDP to port 12201 on
    /// localhost
    pub fn try_default() -> Result<Self> {
        Ok(Layer::with_transport(UdpWriter::local().map_err(|err| {
            Error::Transport {
                source: err,
                back: Backtrace::new(),
            }
        })?))
    }
}

impl<T: Transport> Layer<T> {
    /// Construct a Layer that will send GELF messages via `transport`
    pub fn with_transport(transport: T) -> Self {
        Layer {
            transport,
            facility: None,
            with_target: false,
        }
    }
    /// Stamp every message with `facility`
    pub fn with_facility<S: Into<String>>(mut self, facility: S) -> Self {
        self.facility = Some(facility.into());
        self
    }
    /// Record each event's `tracing` target in the `_target` additional field
    pub fn with_tracing_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn format_event(&self, event: &Event<'_>, meta: &tracing::Metadata<'_>) -> Result<Message> {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let text = visitor.message.ok_or(Error::NoMessageField {
            name: event.metadata().name(),
            back: Backtrace::new(),
        })?;
        let to_err = |source| Error::Message {
            source,
            back: Backtrace::new(),
        };

        let mut builder = Message::from_text(self.transport.hostname(), &text)
            .map_err(to_err)?
            .level(Level::from(meta.level()));
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            builder = builder.call_site(file, line);
        }
        if let Some(facility) = &self.facility {
            builder = builder.facility(facility.as_str());
        }
        if self.with_target {
            builder = builder.field("target", meta.target()).map_err(to_err)?;
        }
        for (name, value) in visitor.fields {
            // One unacceptable field name shouldn't cost us the whole event.
            if let Err(err) = builder.add_field(name, value) {
                ::tracing::debug!(field = name, error = %err, "Skipping field.");
            }
        }
        builder.build().map_err(to_err)
    }
}

/// This is the Big Tuna-- the [`Layer`] implementation.
///
/// [`Layer`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/trait.Layer.html
impl<S, T> tracing_subscriber::layer::Layer<S> for Layer<T>
where
    S: tracing::Subscriber,
    T: Transport + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let _shipping = match Shipping::enter() {
            Some(shipping) => shipping,
            None => return,
        };

        // For events that originated from the `log` crate, normalized_metadata() carries the
        // file/line info; for native tracing events it returns None.
        #[cfg(feature = "tracing-log")]
        let normalized_meta = event.normalized_metadata();
        #[cfg(feature = "tracing-log")]
        let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
        #[cfg(not(feature = "tracing-log"))]
        let meta = event.metadata();

        self.format_event(event, meta)
            .and_then(|msg| {
                self.transport.send(&msg).map_err(|err| Error::Transport {
                    source: err,
                    back: Backtrace::new(),
                })
            })
            .unwrap_or_else(|err| {
                ::tracing::error!(error = %err, "tracing-gelf layer failed to ship an event");
            })
    }
}

#[cfg(test)]
mod smoke {
    use super::*;

    use std::sync::{Arc, Mutex};

    use tracing::{error, info, warn};
    use tracing_subscriber::{layer::SubscriberExt, registry::Registry};

    /// Hang on to everything we're asked to send
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<Message>>>);

    impl Transport for Capture {
        fn send(&self, message: &Message) -> crate::error::Result<()> {
            // Must not find its way back here
            tracing::warn!("captured {}", message.short());
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }
        fn hostname(&self) -> &str {
            "bree.local"
        }
    }

    #[test]
    fn test_layer() {
        let capture = Capture::default();
        let subscriber = Registry::default().with(
            Layer::with_transport(capture.clone())
                .with_facility("smoke")
                .with_tracing_target(true),
        );
        let _guard = tracing::subscriber::set_default(subscriber);

        info!(user = "sp1ff", count = 3, ratio = 0.5, ok = true, "Hello, world!");
        let line = line!() - 1;
        error!("Something went wrong\nHere's the backtrace");
        // Reserved names are dropped; the rest of the event survives
        warn!(host = "imposter", "Careful");
        // No message, nothing to send
        info!(x = 1);

        let got = capture.0.lock().unwrap();
        assert_eq!(got.len(), 3);

        let m = &got[0];
        assert_eq!(m.host(), "bree.local");
        assert_eq!(m.short(), "Hello, world!");
        assert_eq!(m.full(), "");
        assert_eq!(m.level(), Level::LOG_INFO);
        assert_eq!(m.facility(), Some("smoke"));
        assert!(m.file().unwrap().ends_with("layer.rs"));
        assert_eq!(m.line(), Some(line));
        assert_eq!(m.field("_user"), Some(&Value::from("sp1ff")));
        assert_eq!(m.field("_count"), Some(&Value::from(3)));
        assert_eq!(m.field("_ratio"), Some(&Value::from(0.5)));
        assert_eq!(m.field("_ok"), Some(&Value::from(true)));
        assert_eq!(m.field("_target"), Some(&Value::from(module_path!())));

        let m = &got[1];
        assert_eq!(m.short(), "Something went wrong");
        assert_eq!(m.full(), "Something went wrong\nHere's the backtrace");
        assert_eq!(m.level(), Level::LOG_ERR);

        let m = &got[2];
        assert_eq!(m.short(), "Careful");
        assert_eq!(m.host(), "bree.local");
        assert_eq!(m.level(), Level::LOG_WARNING);
    }

    #[test]
    fn test_rejected_fields_are_skipped() {
        let capture = Capture::default();
        let subscriber = Registry::default().with(Layer::with_transport(capture.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        warn!(a = 1, host = "imposter", id = 7, b = "two", "Mixed");

        let got = capture.0.lock().unwrap();
        assert_eq!(got.len(), 1);
        let m = &got[0];
        assert_eq!(m.host(), "bree.local");
        assert_eq!(m.field("a"), Some(&Value::from(1)));
        assert_eq!(m.field("b"), Some(&Value::from("two")));
        assert_eq!(m.field("id"), None);
        assert_eq!(m.additional().len(), 2);
    }
}
