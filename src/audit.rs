//! Structured crawl logging — correlation-id threading plus an optional
//! append-only JSONL audit trail.
//!
//! A `CrawlLog` is constructed explicitly and passed by reference to every
//! component, so a single crawl (or a whole batch) is threaded end-to-end
//! by one correlation id. Child loggers inherit the persistent context of
//! their parent for sub-operations.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

/// Lifecycle-scoped structured logger.
///
/// Entries are emitted through `tracing` and, when a sink is attached,
/// appended as JSONL to the audit file. Cloning is cheap; children share
/// the sink.
#[derive(Clone)]
pub struct CrawlLog {
    correlation_id: String,
    context: Map<String, Value>,
    sink: Option<Arc<Mutex<File>>>,
}

impl CrawlLog {
    /// Create a logger with a fresh correlation id.
    pub fn new() -> Self {
        Self::with_correlation_id(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a logger threaded by the given correlation id.
    pub fn with_correlation_id(id: impl Into<String>) -> Self {
        Self {
            correlation_id: id.into(),
            context: Map::new(),
            sink: None,
        }
    }

    /// Attach an append-only JSONL sink.
    pub fn with_sink(mut self, path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.sink = Some(Arc::new(Mutex::new(file)));
        Ok(self)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Child logger inheriting context, correlation id, and sink.
    pub fn child(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut child = self.clone();
        child.context.insert(key.to_string(), value.into());
        child
    }

    /// Child logger for a sub-operation under a new correlation id,
    /// keeping the inherited context.
    pub fn fork(&self, correlation_id: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.correlation_id = correlation_id.into();
        child
    }

    pub fn debug(&self, message: &str, fields: Value) {
        self.emit(LogLevel::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: Value) {
        self.emit(LogLevel::Info, message, fields);
    }

    pub fn warning(&self, message: &str, fields: Value) {
        self.emit(LogLevel::Warning, message, fields);
    }

    pub fn error(&self, message: &str, fields: Value) {
        self.emit(LogLevel::Error, message, fields);
    }

    pub fn critical(&self, message: &str, fields: Value) {
        self.emit(LogLevel::Critical, message, fields);
    }

    /// Record a security-relevant event (ban, detection, challenge).
    pub fn security_event(&self, kind: &str, fields: Value) {
        let mut merged = fields;
        if let Some(map) = merged.as_object_mut() {
            map.insert("security_event".into(), json!(kind));
        }
        self.emit(LogLevel::Warning, "security event", merged);
    }

    /// Record the duration of a named operation.
    pub fn performance(&self, operation: &str, duration_ms: u64) {
        self.emit(
            LogLevel::Debug,
            "performance",
            json!({ "operation": operation, "duration_ms": duration_ms }),
        );
    }

    fn emit(&self, level: LogLevel, message: &str, fields: Value) {
        let mut merged = self.context.clone();
        if let Value::Object(map) = fields {
            merged.extend(map);
        }
        let context = Value::Object(merged);

        match level {
            LogLevel::Debug => tracing::debug!(
                correlation_id = %self.correlation_id, context = %context, "{message}"
            ),
            LogLevel::Info => tracing::info!(
                correlation_id = %self.correlation_id, context = %context, "{message}"
            ),
            LogLevel::Warning => tracing::warn!(
                correlation_id = %self.correlation_id, context = %context, "{message}"
            ),
            LogLevel::Error | LogLevel::Critical => tracing::error!(
                correlation_id = %self.correlation_id,
                level = level.as_str(),
                context = %context,
                "{message}"
            ),
        }

        if let Some(sink) = &self.sink {
            let entry = json!({
                "timestamp": Utc::now().to_rfc3339(),
                "level": level.as_str(),
                "correlation_id": self.correlation_id,
                "message": message,
                "context": context,
            });
            if let Ok(mut file) = sink.lock() {
                let _ = writeln!(file, "{entry}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_context_and_correlation_id() {
        let log = CrawlLog::with_correlation_id("abc123").child("domain", "example.com");
        let child = log.child("url", "https://example.com/p/1");

        assert_eq!(child.correlation_id(), "abc123");
        assert_eq!(child.context.get("domain").unwrap(), "example.com");
        assert_eq!(
            child.context.get("url").unwrap(),
            "https://example.com/p/1"
        );
        // parent is untouched
        assert!(log.context.get("url").is_none());
    }

    #[test]
    fn sink_receives_jsonl_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = CrawlLog::with_correlation_id("cid-1")
            .with_sink(&path)
            .unwrap();

        log.info("crawl complete", json!({ "status": 200 }));
        log.security_event("profile_banned", json!({ "profile_id": "p1" }));

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["correlation_id"], "cid-1");
        assert_eq!(first["context"]["status"], 200);

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["context"]["security_event"], "profile_banned");
    }

    #[test]
    fn fork_changes_correlation_id_only() {
        let log = CrawlLog::with_correlation_id("parent").child("batch", "b-9");
        let forked = log.fork("item-1");
        assert_eq!(forked.correlation_id(), "item-1");
        assert_eq!(forked.context.get("batch").unwrap(), "b-9");
    }
}
