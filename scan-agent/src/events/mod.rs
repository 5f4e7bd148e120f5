//! Structured scan events.
//!
//! Every component reports progress through an [`EventSink`] instead of
//! writing to a log file or stdout directly:
//! - Walk/classify/manifest progress
//! - Reconciliation and upload decisions
//! - Job acknowledgment and polling status

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Events emitted during a scan run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ScanEvent {
    #[serde(rename = "scan:started")]
    ScanStarted { directory: String },

    /// Walk finished; `candidates` passed classification
    #[serde(rename = "files:discovered")]
    FilesDiscovered { total: usize, candidates: usize },

    #[serde(rename = "file:skipped")]
    FileSkipped { path: String, reason: String },

    #[serde(rename = "manifest:built")]
    ManifestBuilt {
        entries: usize,
        duplicates: usize,
        total_mb: f64,
    },

    #[serde(rename = "manifest:checked")]
    ManifestChecked {
        manifest_id: String,
        covered: bool,
        new_files: usize,
    },

    #[serde(rename = "archive:created")]
    ArchiveCreated { files: usize, bytes: u64 },

    #[serde(rename = "upload:progress")]
    UploadProgress { transferred_bytes: u64, total_bytes: u64 },

    #[serde(rename = "upload:skipped")]
    UploadSkipped { key: String },

    #[serde(rename = "upload:completed")]
    UploadCompleted { key: String, bytes: u64 },

    #[serde(rename = "job:acknowledged")]
    JobAcknowledged { job_id: String, report_uri: String },

    #[serde(rename = "job:pending")]
    JobPending {
        attempt: u32,
        elapsed: String,
        status: String,
    },

    #[serde(rename = "job:ready")]
    ReportReady { url: String },

    #[serde(rename = "job:timed_out")]
    JobTimedOut { attempts: u32 },

    #[serde(rename = "scan:failed")]
    ScanFailed { error: String },
}

impl ScanEvent {
    /// Event name as it appears on the wire and in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ScanEvent::ScanStarted { .. } => "scan:started",
            ScanEvent::FilesDiscovered { .. } => "files:discovered",
            ScanEvent::FileSkipped { .. } => "file:skipped",
            ScanEvent::ManifestBuilt { .. } => "manifest:built",
            ScanEvent::ManifestChecked { .. } => "manifest:checked",
            ScanEvent::ArchiveCreated { .. } => "archive:created",
            ScanEvent::UploadProgress { .. } => "upload:progress",
            ScanEvent::UploadSkipped { .. } => "upload:skipped",
            ScanEvent::UploadCompleted { .. } => "upload:completed",
            ScanEvent::JobAcknowledged { .. } => "job:acknowledged",
            ScanEvent::JobPending { .. } => "job:pending",
            ScanEvent::ReportReady { .. } => "job:ready",
            ScanEvent::JobTimedOut { .. } => "job:timed_out",
            ScanEvent::ScanFailed { .. } => "scan:failed",
        }
    }

    /// Payload fields as a JSON value
    pub fn fields(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Receiver of structured scan events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ScanEvent);
}

/// Renders events as tracing records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ScanEvent) {
        let kind = event.kind();
        let fields = event.fields();
        match event {
            ScanEvent::FileSkipped { .. } | ScanEvent::UploadProgress { .. } => {
                debug!(kind, %fields, "scan event")
            }
            ScanEvent::JobTimedOut { .. } => warn!(kind, %fields, "scan event"),
            ScanEvent::ScanFailed { .. } => error!(kind, %fields, "scan event"),
            _ => info!(kind, %fields, "scan event"),
        }
    }
}

/// Keeps every emitted event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ScanEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScanEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Names of the recorded events, in emission order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(ScanEvent::kind).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ScanEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
