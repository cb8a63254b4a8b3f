//! Captures spans and events emitted on the test thread.
//!
//! Pipeline threads re-enter the caller's span but do not inherit a
//! thread-local default subscriber, so only work done on the calling thread
//! (coordinator phases) is visible here.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone)]
pub struct CapturedSpan {
    pub name: &'static str,
    pub fields: HashMap<String, String>,
    pub parent_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: tracing::Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureStore {
    spans: Arc<Mutex<Vec<CapturedSpan>>>,
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CaptureStore {
    pub fn find_span(&self, name: &str) -> Option<CapturedSpan> {
        self.spans.lock().iter().find(|s| s.name == name).cloned()
    }

    pub fn has_span(&self, name: &str) -> bool {
        self.find_span(name).is_some()
    }

    pub fn find_event(&self, message: &str) -> Option<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .find(|e| e.message == message)
            .cloned()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

struct FieldVisitor(HashMap<String, String>);

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}

struct CaptureLayer {
    store: CaptureStore,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, ctx: Context<'_, S>) {
        let mut fields = FieldVisitor(HashMap::new());
        attrs.record(&mut fields);
        let parent_name = attrs
            .parent()
            .and_then(|pid| ctx.span(pid))
            .map(|span| span.name().to_string())
            .or_else(|| ctx.lookup_current().map(|span| span.name().to_string()));
        self.store.spans.lock().push(CapturedSpan {
            name: attrs.metadata().name(),
            fields: fields.0,
            parent_name,
        });
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldVisitor(HashMap::new());
        event.record(&mut fields);
        let message = fields.0.remove("message").unwrap_or_default();
        self.store.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message,
            fields: fields.0,
        });
    }
}

/// Install a capturing subscriber for the current thread.
///
/// Hold the guard for the duration of the test.
pub fn init_test_tracing() -> (CaptureStore, tracing::subscriber::DefaultGuard) {
    let store = CaptureStore::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer {
        store: store.clone(),
    });
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
