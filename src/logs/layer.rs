//! `tracing` layer that mirrors events into a [`LogStore`]

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{LogLevel, LogRecord, LogStore};

/// Forwards every event it sees into the shared log store.
///
/// The record's source is the event's `source` field when present,
/// otherwise the last path segment of the event target.
pub struct LogStoreLayer {
    store: Arc<LogStore>,
}

impl LogStoreLayer {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self { store }
    }
}

fn map_level(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE | Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warning,
        Level::ERROR => LogLevel::Error,
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    source: Option<String>,
    fields: String,
}

impl RecordVisitor {
    fn push_field(&mut self, name: &str, value: &str) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }

    fn into_message(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "source" => self.source = Some(value.to_string()),
            name => self.push_field(name, value),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "source" => self.source = Some(format!("{:?}", value).trim_matches('"').to_string()),
            name => self.push_field(name, &format!("{:?}", value)),
        }
    }
}

impl<S: Subscriber> Layer<S> for LogStoreLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let source = visitor.source.take().unwrap_or_else(|| {
            metadata
                .target()
                .rsplit("::")
                .next()
                .unwrap_or(super::DEFAULT_SOURCE)
                .to_string()
        });

        self.store.push(LogRecord::new(
            visitor.into_message(),
            map_level(metadata.level()),
            source,
        ));
    }
}
