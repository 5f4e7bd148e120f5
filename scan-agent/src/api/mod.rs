//! Coverage service API.
//!
//! [`CoverageApi`] is the seam between the scan pipeline and the remote
//! service; [`client::ServiceClient`] is the HTTP implementation and
//! [`reconcile`] turns manifest-check responses into coverage decisions.

pub mod client;
pub mod reconcile;

use crate::executor::manifest::Manifest;
use crate::transfer::upload::UploadCredential;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use client::ServiceClient;
pub use reconcile::{FailureKind, ManifestDiff, ReconciliationClient, ReconciliationResult};

/// Identifier assigned by the service. Sent back exactly as received,
/// whether the service used a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Number(n) => write!(f, "{}", n),
            RemoteId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        RemoteId::Text(s.to_string())
    }
}

/// Body of `check-manifest`
#[derive(Debug, Serialize)]
pub struct ManifestCheckRequest<'a> {
    pub api_key: &'a str,
    pub request_id: &'a str,
    pub manifest: &'a Manifest,
}

/// Response of `check-manifest`; every field is optional on the wire and
/// validated by the reconciliation client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestCheckResponse {
    #[serde(default, alias = "manifestId")]
    pub manifest_id: Option<RemoteId>,
    #[serde(default)]
    pub covered: Option<bool>,
    #[serde(default)]
    pub upload: Option<UploadCredential>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hashes: Vec<String>,
    #[serde(default)]
    pub news: Option<Vec<bool>>,
    #[serde(default, alias = "fileIds")]
    pub file_ids: Option<Vec<RemoteId>>,
}

/// Body of `uploaded`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadAck {
    pub api_key: String,
    pub storage_key: Option<String>,
    pub covered: bool,
    pub manifest_id: RemoteId,
    pub paths: Vec<String>,
    pub hashes: Vec<String>,
    pub news: Vec<bool>,
    pub file_ids: Vec<RemoteId>,
}

/// Response of `uploaded`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadAckResponse {
    #[serde(default, alias = "jobId")]
    pub job_id: Option<RemoteId>,
    #[serde(default, alias = "reportUri")]
    pub report_uri: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

/// Remote coverage/analysis service
#[async_trait::async_trait]
pub trait CoverageApi: Send + Sync {
    /// Submit a manifest; `correlation_id` lets the service dedupe retries
    async fn check_manifest(
        &self,
        manifest: &Manifest,
        api_key: &str,
        correlation_id: &str,
    ) -> Result<ManifestCheckResponse, ApiError>;

    /// Report that the upload step finished (or was unnecessary)
    async fn acknowledge_upload(&self, ack: &UploadAck) -> Result<UploadAckResponse, ApiError>;

    /// Fetch job status; the body is either a report URL or a status label
    async fn job_status(&self, report_uri: &str, api_key: &str) -> Result<String, ApiError>;
}
