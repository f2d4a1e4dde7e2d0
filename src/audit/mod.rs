//! Structured audit events recorded at every stage boundary and gate
//! evaluation. Recording never fails: sinks swallow their own errors.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub level: AuditLevel,
    pub message: String,
    /// Caller metadata with `event_type` merged in.
    pub metadata: JsonValue,
}

impl AuditEvent {
    fn new(level: AuditLevel, event_type: &str, message: &str, metadata: JsonValue) -> Self {
        let metadata = match metadata {
            JsonValue::Object(mut map) => {
                map.insert("event_type".into(), JsonValue::from(event_type));
                JsonValue::Object(map)
            }
            JsonValue::Null => json!({ "event_type": event_type }),
            other => json!({ "event_type": event_type, "detail": other }),
        };
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level,
            message: message.to_string(),
            metadata,
        }
    }

    pub fn event_type(&self) -> &str {
        self.metadata
            .get("event_type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
    }
}

pub trait Audit: Send + Sync {
    fn record(&self, level: AuditLevel, event_type: &str, message: &str, metadata: JsonValue);

    fn info(&self, event_type: &str, message: &str, metadata: JsonValue) {
        self.record(AuditLevel::Info, event_type, message, metadata)
    }

    fn warning(&self, event_type: &str, message: &str, metadata: JsonValue) {
        self.record(AuditLevel::Warning, event_type, message, metadata)
    }

    fn error(&self, event_type: &str, message: &str, metadata: JsonValue) {
        self.record(AuditLevel::Error, event_type, message, metadata)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Mirrors audit events into the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl Audit for TracingAudit {
    fn record(&self, level: AuditLevel, event_type: &str, message: &str, metadata: JsonValue) {
        match level {
            AuditLevel::Info => info!(event_type, %metadata, "{}", message),
            AuditLevel::Warning => warn!(event_type, %metadata, "{}", message),
            AuditLevel::Error => error!(event_type, %metadata, "{}", message),
        }
    }
}

/// Appends one JSON object per event to a log file.
pub struct JsonLinesAudit {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesAudit {
    /// Opens `path` for appending. A file that cannot be opened only disables
    /// this sink.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match open_append(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "audit log unavailable; events will not be written");
                None
            }
        };
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

impl Audit for JsonLinesAudit {
    fn record(&self, level: AuditLevel, event_type: &str, message: &str, metadata: JsonValue) {
        let event = AuditEvent::new(level, event_type, message, metadata);
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "could not serialise audit event");
                return;
            }
        };
        let mut guard = lock(&self.file);
        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                warn!(path = %self.path.display(), error = %e, "could not write audit event");
            }
        }
    }
}

/// Keeps events in memory; used by tests and by callers that want to inspect
/// a run's events afterwards.
#[derive(Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

impl Audit for MemoryAudit {
    fn record(&self, level: AuditLevel, event_type: &str, message: &str, metadata: JsonValue) {
        lock(&self.events).push(AuditEvent::new(level, event_type, message, metadata));
    }
}

/// Sends each event to every inner sink.
#[derive(Default, Clone)]
pub struct Fanout(Vec<Arc<dyn Audit>>);

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn Audit>>) -> Self {
        Self(sinks)
    }
}

impl Audit for Fanout {
    fn record(&self, level: AuditLevel, event_type: &str, message: &str, metadata: JsonValue) {
        for sink in &self.0 {
            sink.record(level, event_type, message, metadata.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn json_lines_are_appended_with_event_type() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("pipeline.log");
        let audit = JsonLinesAudit::new(&path);

        audit.info("bronze_save", "Saved 3 rows", json!({ "rows": 3 }));
        audit.warning("bronze_data_quality_issues", "Cube sales failed validation", JsonValue::Null);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<JsonValue> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], "INFO");
        assert_eq!(lines[0]["metadata"]["event_type"], "bronze_save");
        assert_eq!(lines[0]["metadata"]["rows"], 3);
        assert_eq!(lines[1]["level"], "WARNING");
    }

    #[test]
    fn unwritable_log_does_not_fail_recording() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened as an append-only file.
        let audit = JsonLinesAudit::new(dir.path());
        audit.error("pipeline_error", "boom", JsonValue::Null);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAudit::new());
        let b = Arc::new(MemoryAudit::new());
        let fan = Fanout::new(vec![a.clone() as Arc<dyn Audit>, b.clone()]);

        fan.info("pipeline_start", "start", JsonValue::Null);

        assert_eq!(a.count("pipeline_start"), 1);
        assert_eq!(b.events().len(), 1);
    }
}
