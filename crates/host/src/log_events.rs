//! Forward the host's own log lines to connected clients
//!
//! Info and below travel as low-priority events, so a slow subscriber loses
//! them before it loses a warning.

use std::fmt;
use std::time::Instant;
use tether_core::events::EventBroadcaster;
use tether_core::logging::LogLevel;
use tether_core::protocol::{Event, EventKind, LogEvent};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// `tracing` layer that republishes log lines at or above a level as `Log` events
pub struct EventLogLayer {
    events: EventBroadcaster,
    started: Instant,
    min_level: Level,
}

impl EventLogLayer {
    /// Forwards `info!` and more severe
    pub fn new(events: EventBroadcaster, started: Instant) -> Self {
        Self {
            events,
            started,
            min_level: Level::INFO,
        }
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level.into();
        self
    }
}

impl<S: Subscriber> Layer<S> for EventLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // More verbose levels compare greater
        if *metadata.level() > self.min_level || self.events.subscriber_count() == 0 {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.events.publish(Event {
            timestamp_ms: self.started.elapsed().as_millis() as u64,
            kind: EventKind::Log(LogEvent {
                level: LogLevel::from(metadata.level()),
                message: visitor.finish(),
                target: metadata.target().to_string(),
            }),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
