//! Tracing layer that forwards engine warnings to the renderer.
//!
//! The engine never fails on duplicate or out-of-order events, but identity
//! conflicts, durability failures and malformed directives are logged at
//! WARN. This layer turns those log lines into [`DiagnosticEvent`]s so a UI
//! can show them without scraping stderr.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// A warning or error raised somewhere in the engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiagnosticEvent {
    /// Module path of the emitting code (e.g. "canvas_application::reconciler")
    pub target: String,
    pub level: String,
    pub message: String,
    /// Structured fields other than `message`
    pub fields: HashMap<String, Value>,
    pub timestamp: String,
}

/// Forwards WARN and ERROR events to a channel.
pub struct DiagnosticsLayer {
    sender: mpsc::UnboundedSender<DiagnosticEvent>,
    min_level: Level,
}

impl DiagnosticsLayer {
    pub fn new(sender: mpsc::UnboundedSender<DiagnosticEvent>) -> Self {
        Self {
            sender,
            min_level: Level::WARN,
        }
    }

    /// Creates the layer together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DiagnosticEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Also forwards events down to `level` (e.g. `Level::INFO`).
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

impl<S> Layer<S> for DiagnosticsLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level ordering in tracing: ERROR < WARN < INFO.
        if *metadata.level() > self.min_level {
            return;
        }
        if self.sender.is_closed() {
            return;
        }

        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));
        let message = match fields.remove("message") {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => String::new(),
        };

        let _ = self.sender.send(DiagnosticEvent {
            target: metadata.target().to_string(),
            level: metadata.level().to_string(),
            message,
            fields,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }
}

/// Collects event fields as JSON values.
struct FieldVisitor<'a>(&'a mut HashMap<String, Value>);

impl tracing::field::Visit for FieldVisitor<'_> {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{:?}", value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn forwards_warnings_with_fields() {
        let (layer, mut rx) = DiagnosticsLayer::channel();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("[IdentityReconciler] ignored duplicate");
            tracing::warn!(local_id = "s1", attempts = 2u64, "[IdentityReconciler] conflict");
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.level, "WARN");
        assert_eq!(event.message, "[IdentityReconciler] conflict");
        assert_eq!(event.fields.get("local_id"), Some(&Value::from("s1")));
        assert_eq!(event.fields.get("attempts"), Some(&Value::from(2u64)));
        assert!(!event.fields.contains_key("message"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn min_level_can_be_lowered() {
        let (layer, mut rx) = DiagnosticsLayer::channel();
        let subscriber = tracing_subscriber::registry().with(layer.with_min_level(Level::INFO));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("[StreamExecutor] session 's1' aborted: cancelled");
            tracing::error!("actor stopped");
        });

        assert_eq!(rx.try_recv().unwrap().level, "INFO");
        assert_eq!(rx.try_recv().unwrap().level, "ERROR");
    }

    #[test]
    fn closed_receiver_is_tolerated() {
        let (layer, rx) = DiagnosticsLayer::channel();
        drop(rx);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("nobody listening");
        });
    }
}
