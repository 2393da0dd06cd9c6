//! A `tracing_subscriber::Layer` that captures structured log events and
//! forwards them to a `broadcast::Sender<CapturedLog>`.
//!
//! Lets a host process (or a test harness) observe internal log lines
//! without those lines going to stdout/stderr, and without coupling this
//! crate to whatever logging setup the host chooses.

use tokio::sync::broadcast;
use tracing::{Event, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

/// Capacity of the log broadcast channel (buffered entries per subscriber).
pub const LOG_CHANNEL_CAPACITY: usize = 512;

/// A single captured log line, independent of the formatter the host
/// ultimately renders it with.
#[derive(Debug, Clone)]
pub struct CapturedLog {
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Creates a paired `(layer, receiver)`. Install `layer` in a
/// `tracing_subscriber::Registry` alongside any other layers; subscribe to
/// the receiver (or call [`LogCaptureLayer::subscribe`]) for further
/// consumers.
pub fn build_log_channel() -> (LogCaptureLayer, broadcast::Receiver<CapturedLog>) {
    let (tx, rx) = broadcast::channel(LOG_CHANNEL_CAPACITY);
    (LogCaptureLayer { tx }, rx)
}

/// A tracing layer that converts each log `Event` into a [`CapturedLog`] and
/// sends it over a broadcast channel.
///
/// Dropped or lagged receivers are silently ignored — capturing logs never
/// blocks the event loop that emitted them.
pub struct LogCaptureLayer {
    tx: broadcast::Sender<CapturedLog>,
}

impl LogCaptureLayer {
    pub fn subscribe(&self) -> broadcast::Receiver<CapturedLog> {
        self.tx.subscribe()
    }
}

impl<S> Layer<S> for LogCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        let entry = CapturedLog {
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.0,
        };
        let _ = self.tx.send(entry);
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        } else if !self.0.is_empty() {
            self.0.push_str(&format!(", {}={:?}", field.name(), value));
        } else {
            self.0 = format!("{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        } else if !self.0.is_empty() {
            self.0.push_str(&format!(", {}={}", field.name(), value));
        } else {
            self.0 = format!("{}={}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn captures_an_event_with_its_message() {
        let (layer, mut rx) = build_log_channel();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(peer = "node-a", "dialing failed");
        });

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.level, "WARN");
        assert!(entry.message.contains("dialing failed"));
        assert!(entry.message.contains("peer"));
    }
}
