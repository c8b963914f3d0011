// src/events.rs

//! External observer interfaces: LogSink and EventRecorder
//!
//! The core never prints. Structured records and raw phase output go through
//! a [`LogSink`]; run-level events and resource samples go through an
//! [`EventRecorder`]. Both must tolerate concurrent writers. The default
//! implementations write phase output to the layout's `logs/` tree and relay
//! structured records to `tracing`; no-op implementations exist for embedding
//! and tests.

use crate::error::{Error, Result};
use crate::layout::Layout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Severity of a structured record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// A structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub pkg: Option<String>,
    pub phase: Option<String>,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            pkg: None,
            phase: None,
            message: message.into(),
        }
    }

    pub fn for_phase(level: Level, pkg: &str, phase: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            pkg: Some(pkg.to_string()),
            phase: Some(phase.to_string()),
            message: message.into(),
        }
    }
}

/// Receiver for structured records and raw phase output streams.
pub trait LogSink: Send + Sync {
    /// Accept one structured record.
    fn record(&self, record: &LogRecord);

    /// Open a writer for one `(pkg, phase)` output stream. Subsequent calls
    /// for the same pair truncate the previous capture.
    fn phase_writer(&self, pkg: &str, phase: &str) -> Result<Box<dyn Write + Send>>;
}

/// A run-level event for the telemetry backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub job_id: Option<String>,
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(run_id: Uuid, level: Level, message: impl Into<String>) -> Self {
        Self {
            run_id,
            job_id: None,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(run_id: Uuid, job_id: &str, level: Level, message: impl Into<String>) -> Self {
        Self {
            run_id,
            job_id: Some(job_id.to_string()),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A point-in-time resource usage sample for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub job_id: String,
    pub cpu_user_pct: f64,
    pub cpu_system_pct: f64,
    pub mem_used: u64,
    pub disk_used: u64,
    pub load_1_5_15: (f64, f64, f64),
    pub timestamp: DateTime<Utc>,
}

/// Receiver for run events and resource samples. Implementations may no-op.
pub trait EventRecorder: Send + Sync {
    fn event(&self, event: &RunEvent);
    fn sample(&self, sample: &ResourceSample);
}

/// Sink that drops everything. Useful for embedding and tests.
pub struct NullSink;

impl LogSink for NullSink {
    fn record(&self, _record: &LogRecord) {}

    fn phase_writer(&self, _pkg: &str, _phase: &str) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(std::io::sink()))
    }
}

impl EventRecorder for NullSink {
    fn event(&self, _event: &RunEvent) {}
    fn sample(&self, _sample: &ResourceSample) {}
}

/// Default sink: phase output goes to `<root>/logs/<pkg>/<phase>.log`,
/// structured records are relayed to `tracing`.
pub struct FileLogSink {
    layout: Arc<Layout>,
}

impl FileLogSink {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self { layout }
    }
}

impl LogSink for FileLogSink {
    fn record(&self, record: &LogRecord) {
        let pkg = record.pkg.as_deref().unwrap_or("-");
        let phase = record.phase.as_deref().unwrap_or("-");
        match record.level {
            Level::Debug => tracing::debug!(pkg, phase, "{}", record.message),
            Level::Info => tracing::info!(pkg, phase, "{}", record.message),
            Level::Warn => tracing::warn!(pkg, phase, "{}", record.message),
            Level::Error => tracing::error!(pkg, phase, "{}", record.message),
        }
    }

    fn phase_writer(&self, pkg: &str, phase: &str) -> Result<Box<dyn Write + Send>> {
        let dir = self.layout.log_dir(pkg);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::IoError(format!("create log dir {}: {e}", dir.display())))?;

        let path: PathBuf = self.layout.log_file(pkg, phase);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::IoError(format!("open log {}: {e}", path.display())))?;

        Ok(Box::new(file))
    }
}

/// Recorder that relays run events to `tracing` and drops samples.
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn event(&self, event: &RunEvent) {
        let job = event.job_id.as_deref().unwrap_or("-");
        match event.level {
            Level::Debug => tracing::debug!(run = %event.run_id, job, "{}", event.message),
            Level::Info => tracing::info!(run = %event.run_id, job, "{}", event.message),
            Level::Warn => tracing::warn!(run = %event.run_id, job, "{}", event.message),
            Level::Error => tracing::error!(run = %event.run_id, job, "{}", event.message),
        }
    }

    fn sample(&self, _sample: &ResourceSample) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_sink_writes_phase_log() {
        let tmp = TempDir::new().unwrap();
        let layout = Arc::new(Layout::new(tmp.path()));
        layout.ensure().unwrap();

        let sink = FileLogSink::new(layout.clone());
        let mut w = sink.phase_writer("zlib", "configure").unwrap();
        w.write_all(b"checking for gcc... yes\n").unwrap();
        drop(w);

        let contents = std::fs::read_to_string(layout.log_file("zlib", "configure")).unwrap();
        assert!(contents.contains("checking for gcc"));
    }

    #[test]
    fn test_file_sink_truncates_on_reopen() {
        let tmp = TempDir::new().unwrap();
        let layout = Arc::new(Layout::new(tmp.path()));
        layout.ensure().unwrap();

        let sink = FileLogSink::new(layout.clone());
        sink.phase_writer("zlib", "make")
            .unwrap()
            .write_all(b"first attempt\n")
            .unwrap();
        sink.phase_writer("zlib", "make")
            .unwrap()
            .write_all(b"second\n")
            .unwrap();

        let contents = std::fs::read_to_string(layout.log_file("zlib", "make")).unwrap();
        assert_eq!(contents, "second\n");
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        let sink = NullSink;
        sink.record(&LogRecord::new(Level::Info, "hello"));
        let mut w = sink.phase_writer("a", "b").unwrap();
        w.write_all(b"dropped").unwrap();
        sink.event(&RunEvent::new(Uuid::new_v4(), Level::Info, "ev"));
    }
}
