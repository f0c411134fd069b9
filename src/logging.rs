//! Operator log capture.
//!
//! Side-effect failures and other operational events are surfaced through a
//! tracing layer into an in-memory ring buffer, which the review panel reads
//! and streams over SSE. The buffer is the operator-visible error channel
//! for failed deliveries: the dispatcher logs them here and never touches
//! request state.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A single captured log event.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogEntry {
    pub fn format(&self) -> String {
        format!(
            "{} {} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.target,
            self.message
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "level": self.level,
            "target": self.target,
            "message": self.message
        })
        .to_string()
    }

    pub fn is_error(&self) -> bool {
        self.level == "ERROR"
    }
}

/// Ring buffer of recent events plus a broadcast channel for live streams.
pub struct LogBuffer {
    tx: broadcast::Sender<LogEntry>,
    recent: parking_lot::RwLock<Vec<LogEntry>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self {
            tx,
            recent: parking_lot::RwLock::new(Vec::with_capacity(max_entries)),
            max_entries,
        }
    }

    pub fn push(&self, entry: LogEntry) {
        {
            let mut recent = self.recent.write();
            if recent.len() >= self.max_entries {
                recent.remove(0);
            }
            recent.push(entry.clone());
        }

        // No receivers is fine; the stream endpoint may not be open
        let _ = self.tx.send(entry);
    }

    pub fn get_recent(&self, count: usize) -> Vec<LogEntry> {
        let recent = self.recent.read();
        let start = recent.len().saturating_sub(count);
        recent[start..].to_vec()
    }

    /// Recent ERROR entries: failed deliveries and storage problems, shown
    /// on the review panel dashboard.
    pub fn recent_errors(&self, count: usize) -> Vec<LogEntry> {
        let recent = self.recent.read();
        recent
            .iter()
            .rev()
            .filter(|e| e.is_error())
            .take(count)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}

/// Shared log buffer type
pub type SharedLogBuffer = Arc<LogBuffer>;

pub fn create_log_buffer(max_entries: usize) -> SharedLogBuffer {
    Arc::new(LogBuffer::new(max_entries))
}

/// Tracing layer feeding the buffer.
pub struct LogCaptureLayer {
    buffer: SharedLogBuffer,
}

impl LogCaptureLayer {
    pub fn new(buffer: SharedLogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S> Layer<S> for LogCaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.buffer.push(LogEntry {
            timestamp: chrono::Utc::now(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        });
    }
}

/// Extracts the message field from a tracing event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else if self.message.is_empty() {
            self.message = format!("{}={}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: &str, message: &str) -> LogEntry {
        LogEntry {
            timestamp: chrono::Utc::now(),
            level: level.to_string(),
            target: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_buffer_keeps_most_recent() {
        let buffer = create_log_buffer(2);
        for i in 1..=5 {
            buffer.push(entry("INFO", &format!("Message {}", i)));
        }

        let recent = buffer.get_recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "Message 4");
        assert_eq!(recent[1].message, "Message 5");
    }

    #[test]
    fn test_recent_errors_filters_level() {
        let buffer = create_log_buffer(10);
        buffer.push(entry("INFO", "delivered"));
        buffer.push(entry("ERROR", "grant_role failed"));
        buffer.push(entry("WARN", "slow response"));
        buffer.push(entry("ERROR", "mail api down"));

        let errors = buffer.recent_errors(10);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "mail api down");
        assert_eq!(errors[1].message, "grant_role failed");
    }
}
