//! Upload acknowledgment and report polling.
//!
//! `AwaitingAck -> Acknowledged -> Polling -> {ReportReady | TimedOut}`, with
//! `AckFailed` as the terminal state for a rejected acknowledgment. Polling
//! runs at a fixed cadence for a bounded number of attempts; failures are
//! never retried.

use crate::api::{ApiError, CoverageApi, ManifestDiff, RemoteId, UploadAck};
use crate::config::PollingConfig;
use crate::events::{EventSink, ScanEvent};
use crate::transfer::progress::format_duration;
use crate::utils::errors::{Result, ScanError};
use reqwest::Url;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    AwaitingAck,
    Acknowledged,
    Polling,
    ReportReady,
    TimedOut,
    AckFailed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::ReportReady | JobState::TimedOut | JobState::AckFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// Job still running; carries the elapsed-time label
    Pending(String),
    ReportReady(String),
    TimedOut,
}

/// What one job-status body says
enum StatusReply {
    Ready(String),
    /// Status label sent by the service
    Running(String),
}

/// A job accepted by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: RemoteId,
    pub report_uri: String,
}

/// The run's job record. Created after reconciliation; the acknowledgment
/// fills in `job_id` and `report_uri`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub api_key: String,
    pub manifest_record_id: RemoteId,
    pub covered: bool,
    /// Stored archive key; `None` when nothing was uploaded
    pub storage_key: Option<String>,
    pub job_id: Option<RemoteId>,
    pub report_uri: Option<String>,
}

impl ScanJob {
    pub fn new(
        api_key: &str,
        manifest_record_id: RemoteId,
        covered: bool,
        storage_key: Option<String>,
    ) -> Self {
        Self {
            api_key: api_key.to_string(),
            manifest_record_id,
            covered,
            storage_key,
            job_id: None,
            report_uri: None,
        }
    }

    /// Body of the upload-completion acknowledgment
    pub fn upload_ack(&self, diff: &ManifestDiff) -> UploadAck {
        UploadAck {
            api_key: self.api_key.clone(),
            storage_key: self.storage_key.clone(),
            covered: self.covered,
            manifest_id: self.manifest_record_id.clone(),
            paths: diff.paths.clone(),
            hashes: diff.hashes.clone(),
            news: diff.news.clone(),
            file_ids: diff.file_ids.clone(),
        }
    }
}

pub struct JobMonitor {
    api: Arc<dyn CoverageApi>,
    polling: PollingConfig,
    sink: Arc<dyn EventSink>,
    state: JobState,
}

impl JobMonitor {
    pub fn new(api: Arc<dyn CoverageApi>, polling: PollingConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            api,
            polling,
            sink,
            state: JobState::AwaitingAck,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Send the upload-completion acknowledgment and start a job.
    pub async fn acknowledge(
        &mut self,
        job: &mut ScanJob,
        diff: &ManifestDiff,
    ) -> Result<JobHandle> {
        let ack = job.upload_ack(diff);
        let response = match self.api.acknowledge_upload(&ack).await {
            Ok(response) => response,
            Err(e) => {
                self.state = JobState::AckFailed;
                warn!("Upload acknowledgment failed: {}", e);
                return Err(match e {
                    ApiError::Transport(e) => ScanError::Transport(e.to_string()),
                    other => ScanError::AckFailed(other.to_string()),
                });
            }
        };

        let (Some(job_id), Some(report_uri)) = (response.job_id, response.report_uri) else {
            self.state = JobState::AckFailed;
            return Err(ScanError::AckFailed(
                "response has no job id or report URI".to_string(),
            ));
        };

        self.state = JobState::Acknowledged;
        job.job_id = Some(job_id.clone());
        job.report_uri = Some(report_uri.clone());
        info!("Job {} started, report status at {}", job_id, report_uri);
        self.sink.emit(ScanEvent::JobAcknowledged {
            job_id: job_id.to_string(),
            report_uri: report_uri.clone(),
        });

        Ok(JobHandle { job_id, report_uri })
    }

    async fn fetch_status(&self, job: &JobHandle, api_key: &str) -> Result<StatusReply> {
        let body = self
            .api
            .job_status(&job.report_uri, api_key)
            .await
            .map_err(|e| ScanError::Poll(e.to_string()))?;

        Ok(match report_url(&body) {
            Some(url) => StatusReply::Ready(url),
            None => StatusReply::Running(unquote(&body)),
        })
    }

    /// Issue one status request. A running job is reported as `Pending`
    /// with the time elapsed since `started`.
    pub async fn poll_once(
        &self,
        job: &JobHandle,
        api_key: &str,
        attempt: u32,
        started: Instant,
    ) -> Result<PollResult> {
        match self.fetch_status(job, api_key).await? {
            StatusReply::Ready(url) => Ok(PollResult::ReportReady(url)),
            StatusReply::Running(status) => {
                let elapsed = format_duration(started.elapsed().as_secs());
                debug!("Job {} pending ({}), attempt {}", job.job_id, status, attempt);
                self.sink.emit(ScanEvent::JobPending {
                    attempt,
                    elapsed: elapsed.clone(),
                    status,
                });
                Ok(PollResult::Pending(elapsed))
            }
        }
    }

    /// Poll until the report is ready or `max_attempts` is used up.
    ///
    /// Every attempt that does not yield a report is followed by the fixed
    /// delay, so a timed-out job has waited `delay × max_attempts`.
    pub async fn wait_for_report(&mut self, job: &JobHandle, api_key: &str) -> Result<PollResult> {
        self.state = JobState::Polling;
        let started = Instant::now();

        for attempt in 1..=self.polling.max_attempts {
            let result = self.poll_once(job, api_key, attempt, started).await?;
            if let PollResult::ReportReady(url) = result {
                self.state = JobState::ReportReady;
                info!("Report ready after {} attempt(s): {}", attempt, url);
                self.sink.emit(ScanEvent::ReportReady { url: url.clone() });
                return Ok(PollResult::ReportReady(url));
            }

            tokio::time::sleep(self.polling.delay()).await;
        }

        self.state = JobState::TimedOut;
        warn!(
            "Job {} not finished after {} attempts",
            job.job_id, self.polling.max_attempts
        );
        self.sink.emit(ScanEvent::JobTimedOut {
            attempts: self.polling.max_attempts,
        });
        Ok(PollResult::TimedOut)
    }
}

/// The report URL in a job-status body, if it is one.
///
/// The body may be plain text or a JSON string; anything that is not an
/// absolute http(s) URL is a status label.
pub fn report_url(body: &str) -> Option<String> {
    let candidate = unquote(body);
    let url = Url::parse(&candidate).ok()?;
    let web = matches!(url.scheme(), "http" | "https");
    if web && url.host_str().is_some() {
        Some(candidate)
    } else {
        None
    }
}

/// Body text with surrounding whitespace and JSON string quoting removed
fn unquote(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.starts_with('"') {
        if let Ok(text) = serde_json::from_str::<String>(trimmed) {
            return text;
        }
    }
    trimmed.to_string()
}
