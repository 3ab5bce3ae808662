//! In-memory log capture for asserting on emitted `tracing` events.
//!
//! [`LogCapture`] is a `tracing_subscriber` layer that records every event,
//! including its structured fields, into a bounded ring buffer.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// A single captured event.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    /// Non-message fields rendered as `name=value`, in recording order.
    pub fields: Vec<String>,
}

impl CapturedEvent {
    /// Whether the message or any field contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.message.contains(needle) || self.fields.iter().any(|f| f.contains(needle))
    }
}

#[derive(Debug)]
struct Buffer {
    events: VecDeque<CapturedEvent>,
    capacity: usize,
}

/// A `tracing` layer that keeps the most recent events in memory.
#[derive(Debug, Clone)]
pub struct LogCapture {
    buffer: Arc<Mutex<Buffer>>,
}

impl LogCapture {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Buffer {
                events: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Install a registry with this layer as the current thread's default
    /// subscriber until the guard is dropped.
    pub fn set_default(&self) -> DefaultGuard {
        tracing_subscriber::registry()
            .with(self.clone())
            .set_default()
    }

    /// Snapshot of everything captured so far, oldest first.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.buffer
            .lock()
            .map(|buf| buf.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether an event at `level` mentions `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.events()
            .iter()
            .any(|e| e.level == level && e.mentions(needle))
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().map(|buf| buf.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Ok(mut buf) = self.buffer.lock() {
            if buf.capacity == 0 {
                return;
            }
            if buf.events.len() >= buf.capacity {
                buf.events.pop_front();
            }
            buf.events.push_back(CapturedEvent {
                level: *metadata.level(),
                target: metadata.target().to_string(),
                message: visitor.message,
                fields: visitor.fields,
            });
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let mut rendered = String::new();
            let _ = write!(rendered, "{}={value:?}", field.name());
            self.fields.push(rendered);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }
}
