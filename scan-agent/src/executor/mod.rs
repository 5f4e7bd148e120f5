//! Scan executor - sequences one scan run end to end.
//!
//! classify -> build manifest -> reconcile -> package + upload (when the
//! service asks for it) -> acknowledge -> poll for the report. Each step is
//! awaited before the next one starts; filesystem work runs on the blocking
//! pool.

pub mod job_monitor;
pub mod manifest;

use crate::api::{
    CoverageApi, FailureKind, ManifestDiff, ReconciliationClient, ReconciliationResult, RemoteId,
    ServiceClient,
};
use crate::config::Config;
use crate::events::{EventSink, ScanEvent};
use crate::fs::{walk_directory, FileClassifier, SourceClassifier, WalkOptions};
use crate::transfer::{DefaultTransportProvider, PackagerUploader, TransportProvider, UploadOutcome};
use crate::utils::errors::{Result, ScanError};
use job_monitor::{JobMonitor, PollResult, ScanJob};
use manifest::{BuildStats, Manifest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// How a run ended, when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// No source files under the directory; the service was not contacted
    NothingToScan,
    ReportReady(String),
    /// Polling gave up; the job keeps running on the service
    TimedOut,
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub files_discovered: usize,
    pub manifest_entries: usize,
    /// Whether an archive was sent this run
    pub uploaded: bool,
    pub job_id: Option<RemoteId>,
    pub outcome: ScanOutcome,
}

/// Reject anything but a non-empty ASCII alphanumeric key.
pub fn validate_api_key(api_key: &str) -> Result<()> {
    if api_key.is_empty() {
        return Err(ScanError::InvalidApiKey("API key is empty".to_string()));
    }
    if !api_key.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ScanError::InvalidApiKey(
            "API key must contain only letters and digits".to_string(),
        ));
    }
    Ok(())
}

/// Absolute form of `dir`, which must be an existing directory.
pub fn validate_directory(dir: &Path) -> Result<PathBuf> {
    let resolved = std::fs::canonicalize(dir)
        .map_err(|e| ScanError::InvalidDirectory(format!("{}: {}", dir.display(), e)))?;
    if !resolved.is_dir() {
        return Err(ScanError::InvalidDirectory(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    Ok(resolved)
}

/// Result of the local discovery phase
struct Discovery {
    files_discovered: usize,
    candidates: usize,
    manifest: Manifest,
    stats: BuildStats,
}

/// Walk, classify and hash. Runs on the blocking pool.
fn discover(base_dir: &Path, config: &Config) -> Result<Discovery> {
    let options = WalkOptions {
        exclude_patterns: config.scan.exclude_patterns.clone(),
        ..WalkOptions::default()
    };
    let files = walk_directory(base_dir, options)
        .map_err(|e| ScanError::InvalidDirectory(format!("{}: {}", base_dir.display(), e)))?;

    let classifier = FileClassifier::new(config.scan.max_unknown_size);
    let candidates: Vec<(PathBuf, u64)> = files
        .iter()
        .filter(|file| classifier.classify(&file.path, file.size).is_source())
        .map(|file| (file.path.clone(), file.size))
        .collect();

    let (manifest, stats) = manifest::build(&candidates);

    Ok(Discovery {
        files_discovered: files.len(),
        candidates: candidates.len(),
        manifest,
        stats,
    })
}

pub struct ScanOrchestrator {
    config: Config,
    api: Arc<dyn CoverageApi>,
    transports: Arc<dyn TransportProvider>,
    sink: Arc<dyn EventSink>,
}

impl ScanOrchestrator {
    pub fn new(
        config: Config,
        api: Arc<dyn CoverageApi>,
        transports: Arc<dyn TransportProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            api,
            transports,
            sink,
        }
    }

    /// Orchestrator talking to the configured service over HTTP
    pub fn from_config(config: Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let client = ServiceClient::from_config(&config)?;
        let transports = DefaultTransportProvider::new(client.http().clone(), Arc::clone(&sink));
        Ok(Self::new(config, Arc::new(client), Arc::new(transports), sink))
    }

    /// Run one scan of `dir`.
    pub async fn run(&self, api_key: &str, dir: &Path) -> Result<ScanReport> {
        let result = self.execute(api_key, dir).await;
        if let Err(e) = &result {
            self.sink.emit(ScanEvent::ScanFailed {
                error: e.to_string(),
            });
        }
        result
    }

    async fn execute(&self, api_key: &str, dir: &Path) -> Result<ScanReport> {
        // Input checks come first: nothing below may run on bad input
        validate_api_key(api_key)?;
        let base_dir = validate_directory(dir)?;

        info!("Scanning {}", base_dir.display());
        self.sink.emit(ScanEvent::ScanStarted {
            directory: base_dir.display().to_string(),
        });

        let discovery = {
            let base_dir = base_dir.clone();
            let config = self.config.clone();
            tokio::task::spawn_blocking(move || discover(&base_dir, &config)).await??
        };
        self.report_discovery(&discovery);

        let manifest = discovery.manifest;
        let mut report = ScanReport {
            files_discovered: discovery.files_discovered,
            manifest_entries: manifest.len(),
            uploaded: false,
            job_id: None,
            outcome: ScanOutcome::NothingToScan,
        };

        if manifest.is_empty() {
            info!("No source files found under {}", base_dir.display());
            return Ok(report);
        }

        let reconciliation = ReconciliationClient::new(self.api.as_ref())
            .check_manifest(&manifest, api_key)
            .await;

        let (manifest_id, covered, storage_key, diff) = match reconciliation {
            ReconciliationResult::Failed { kind, reason } => {
                return Err(match kind {
                    FailureKind::Transport => ScanError::Transport(reason),
                    FailureKind::Rejected => ScanError::RemoteRejection(reason),
                });
            }
            ReconciliationResult::Covered {
                manifest_record_id,
                diff,
            } => {
                self.sink.emit(ScanEvent::ManifestChecked {
                    manifest_id: manifest_record_id.to_string(),
                    covered: true,
                    new_files: 0,
                });
                (manifest_record_id, true, None, diff)
            }
            ReconciliationResult::NotCovered {
                manifest_record_id,
                upload_credential,
                new_file_ids,
                new_file_paths,
                diff,
            } => {
                self.sink.emit(ScanEvent::ManifestChecked {
                    manifest_id: manifest_record_id.to_string(),
                    covered: false,
                    new_files: new_file_paths.len(),
                });

                let storage_key = if new_file_paths.is_empty() {
                    info!("Service knows every file already, nothing to upload");
                    None
                } else {
                    let transport = self
                        .transports
                        .select(&upload_credential, &manifest_record_id)?;
                    let outcome = PackagerUploader::new(Arc::clone(&self.sink))
                        .package_and_upload(&manifest, &new_file_paths, &base_dir, transport.as_ref())
                        .await;
                    report.uploaded = matches!(outcome, UploadOutcome::Done { .. });
                    Some(outcome.into_result()?)
                };

                let diff = ManifestDiff {
                    file_ids: new_file_ids,
                    ..diff
                };
                (manifest_record_id, false, storage_key, diff)
            }
        };

        let mut scan_job = ScanJob::new(api_key, manifest_id, covered, storage_key);

        let mut monitor = JobMonitor::new(
            Arc::clone(&self.api),
            self.config.polling.clone(),
            Arc::clone(&self.sink),
        );
        let job = monitor.acknowledge(&mut scan_job, &diff).await?;
        report.job_id = scan_job.job_id.clone();

        report.outcome = match monitor.wait_for_report(&job, api_key).await? {
            PollResult::ReportReady(url) => ScanOutcome::ReportReady(url),
            PollResult::Pending(_) | PollResult::TimedOut => {
                warn!("Report not ready yet; check the dashboard later");
                ScanOutcome::TimedOut
            }
        };

        Ok(report)
    }

    fn report_discovery(&self, discovery: &Discovery) {
        self.sink.emit(ScanEvent::FilesDiscovered {
            total: discovery.files_discovered,
            candidates: discovery.candidates,
        });
        for (path, reason) in &discovery.stats.skipped {
            self.sink.emit(ScanEvent::FileSkipped {
                path: path.clone(),
                reason: reason.clone(),
            });
        }
        self.sink.emit(ScanEvent::ManifestBuilt {
            entries: discovery.manifest.len(),
            duplicates: discovery.stats.duplicates,
            total_mb: discovery.manifest.total_mb(),
        });
    }
}
