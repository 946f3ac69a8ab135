use crate::broker::Publisher;
use crate::record::{Fields, Level, LogRecord};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Target prefix of this crate's own events; never captured.
const OWN_TARGET: &str = "log_harbor";

/// Map a `tracing` level onto the record severity scale.
pub fn level_from_tracing(level: &tracing::Level) -> Level {
    match *level {
        tracing::Level::ERROR => Level::Severe,
        tracing::Level::WARN => Level::Warning,
        tracing::Level::INFO => Level::Info,
        tracing::Level::DEBUG => Level::Fine,
        tracing::Level::TRACE => Level::Finest,
    }
}

/// `tracing_subscriber` layer that turns the process's own events into
/// [`LogRecord`]s and publishes them through the broker.
///
/// Each captured event becomes a single-record batch. Publishing never
/// blocks, so a slow sink costs dropped records rather than latency on
/// the calling thread. Events emitted by this crate are ignored, as
/// they would otherwise loop back through the broker.
pub struct BrokerLayer<P> {
    publisher: P,
    min_level: tracing::Level,
    source: String,
    sequence: AtomicU64,
    cancel: CancellationToken,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Successfully handed to the broker.
    pub published_events: Arc<AtomicU64>,
}

impl<P: Publisher> BrokerLayer<P> {
    /// Capture events at `min_level` and above, tagging them with `source`.
    pub fn new(publisher: P, min_level: tracing::Level, source: impl Into<String>) -> Self {
        Self {
            publisher,
            min_level,
            source: source.into(),
            sequence: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            total_events: Arc::new(AtomicU64::new(0)),
            published_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Token checked on every publish; cancel it to stop capturing.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn build_record(&self, event: &Event<'_>) -> LogRecord {
        let mut fields = Fields::new();
        let mut message: Option<String> = None;
        event.record(&mut FieldVisitor {
            fields: &mut fields,
            message: &mut message,
        });

        let meta = event.metadata();
        let mut record = LogRecord::new(message.unwrap_or_default(), Utc::now())
            .with_level(level_from_tracing(meta.level()))
            .with_sequence(self.sequence.fetch_add(1, Ordering::Relaxed));
        record.logger_name = meta.target().to_string();
        record.source = self.source.clone();

        if let Some(session_id) = take_string(&mut fields, "session_id") {
            record.session_id = session_id;
        }
        if let Some(client_id) = take_string(&mut fields, "client_id") {
            record.client_id = client_id;
        }
        record.error = take_string(&mut fields, "error");
        if !fields.is_empty() {
            record.extra = Some(fields);
        }
        record
    }
}

fn take_string(fields: &mut Fields, key: &str) -> Option<String> {
    match fields.remove(key)? {
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl<S, P> Layer<S> for BrokerLayer<P>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    P: Publisher + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let meta = event.metadata();
        if *meta.level() > self.min_level || meta.target().starts_with(OWN_TARGET) {
            return;
        }

        let record = self.build_record(event);
        if self.publisher.publish(&self.cancel, vec![record]).is_ok() {
            self.published_events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Collects event fields into a JSON map, splitting out `message`.
pub struct FieldVisitor<'a> {
    pub fields: &'a mut Fields,
    pub message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(format!("{:?}", value)));
        }
    }
}
