//! Time and Logging Abstractions
//!
//! Provides injectable time source and logging sink for testing and platform integration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

/// Time source trait
///
/// Abstracts system time to enable deterministic testing and support
/// for host-specified timezones.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::time::Clock;
///
/// fn log_timestamp(clock: &dyn Clock) {
///     let cache_buster = clock.unix_timestamp_millis();
///     println!("_cb={}", cache_buster);
/// }
/// ```
pub trait Clock: Send + Sync {
    /// Get current UTC time
    fn now(&self) -> DateTime<Utc>;

    /// Get current Unix timestamp in seconds
    fn unix_timestamp(&self) -> i64 {
        self.now().timestamp()
    }

    /// Get current Unix timestamp in milliseconds
    fn unix_timestamp_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// System clock implementation using actual system time
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic staleness and backoff tests.
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Severity of a forwarded log line. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One tracing event mirrored to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    /// Emitting module, e.g. `core_sync::coordinator`
    pub target: String,
    pub message: String,
    /// Structured fields (`pass_id`, `kind`, `url`, ...), already redacted
    pub fields: HashMap<String, String>,
    /// Enclosing span, usually the sync pass
    pub span_id: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            target: target.into(),
            message: message.into(),
            fields: HashMap::new(),
            span_id: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_span_id(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }
}

/// Host log pipeline that receives the engine's tracing output.
///
/// The logging layer hands entries over after secret redaction, so sinks can
/// write them as-is. Entries below [`min_level`](Self::min_level) are dropped
/// before they are built.
///
/// ```ignore
/// use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
///
/// async fn report_notice(logger: &dyn LoggerSink, kind: &str) {
///     let entry = LogEntry::new(LogLevel::Warn, "core_sync", "Sync notice raised")
///         .with_field("kind", kind);
///     logger.log(entry).await.ok();
/// }
/// ```
#[async_trait::async_trait]
pub trait LoggerSink: Send + Sync {
    async fn log(&self, entry: LogEntry) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn min_level(&self) -> LogLevel {
        LogLevel::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock;
        let now = clock.now();
        let timestamp = clock.unix_timestamp();

        assert!(timestamp > 0);
        assert!(timestamp >= now.timestamp());
    }

    #[test]
    fn test_log_entry_builder() {
        let entry = LogEntry::new(LogLevel::Warn, "core_sync", "Sync failed")
            .with_field("kind", "Network")
            .with_span_id("pass-456");

        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.target, "core_sync");
        assert_eq!(entry.message, "Sync failed");
        assert_eq!(entry.fields.get("kind"), Some(&"Network".to_string()));
        assert_eq!(entry.span_id, Some("pass-456".to_string()));
    }

    #[test]
    fn test_fixed_clock_advances() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        clock.advance(chrono::Duration::seconds(90));

        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        assert_eq!(clock.unix_timestamp(), (start + chrono::Duration::seconds(90)).timestamp());
    }

    struct Recording(std::sync::Mutex<Vec<LogEntry>>);

    #[async_trait::async_trait]
    impl LoggerSink for Recording {
        async fn log(&self, entry: LogEntry) -> Result<()> {
            self.0.lock().unwrap().push(entry);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_defaults() {
        let sink = Recording(std::sync::Mutex::new(Vec::new()));
        assert_eq!(sink.min_level(), LogLevel::Info);
        assert!(LogLevel::Warn > sink.min_level());

        sink.log(LogEntry::new(LogLevel::Info, "core_sync", "Sync succeeded"))
            .await
            .unwrap();
        sink.flush().await.unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }
}
