//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use threadworker::{
    Handler, HandlerFailure, MemoryMessage, Message, SubscriptionConfig, WorkerConfig,
};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// One recorded log event
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Layer recording every event it sees
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch that records into this capture
    pub fn dispatch(&self) -> Dispatch {
        Dispatch::new(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Events carrying `message_id`, in emission order
    pub fn for_message(&self, message_id: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.field("message_id") == Some(message_id))
            .collect()
    }

    /// First event whose message contains `text`
    pub fn find(&self, text: &str) -> Option<CapturedEvent> {
        self.events().into_iter().find(|e| e.message.contains(text))
    }

    pub fn count(&self, text: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.message.contains(text))
            .count()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{:?}", value));
        }
    }
}

/// Record of one exception handler call
#[derive(Debug, Clone)]
pub struct Reported {
    pub message_id: String,
    pub body: Vec<u8>,
    pub timed_out: bool,
    pub description: String,
    pub at: std::time::Instant,
}

/// Exception handler recording every call
pub fn recording_exception_handler() -> (
    threadworker::ExceptionHandler<MemoryMessage>,
    Arc<Mutex<Vec<Reported>>>,
) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let handler: threadworker::ExceptionHandler<MemoryMessage> = {
        let reports = Arc::clone(&reports);
        Arc::new(move |message: &MemoryMessage, failure: &HandlerFailure| {
            reports.lock().push(Reported {
                message_id: message.id().to_string(),
                body: message.body().to_vec(),
                timed_out: failure.is_timeout(),
                description: failure.to_string(),
                at: std::time::Instant::now(),
            });
        })
    };
    (handler, reports)
}

pub fn worker_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig::new(SubscriptionConfig::new("orders", "billing")).with_concurrency(concurrency)
}

/// Handler that accepts every message
pub fn noop() -> Handler<MemoryMessage> {
    Arc::new(|_| Ok(()))
}

pub fn message(body: &str) -> Arc<MemoryMessage> {
    Arc::new(MemoryMessage::new("orders", body.as_bytes().to_vec()))
}

/// Sleep long enough for background tasks to settle
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}
