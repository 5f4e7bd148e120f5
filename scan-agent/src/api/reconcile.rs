//! Manifest reconciliation against the coverage service.
//!
//! One `check-manifest` call per run, tagged with a fresh correlation token.
//! No retries: a failed attempt is returned as [`ReconciliationResult::Failed`]
//! and the orchestrator decides what to do with it.

use super::{ApiError, CoverageApi, ManifestCheckResponse, RemoteId};
use crate::executor::manifest::Manifest;
use crate::transfer::upload::UploadCredential;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Why reconciliation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network error or timeout
    Transport,
    /// Error status, or a response missing required fields
    Rejected,
}

/// The service's view of the manifest, echoed back on acknowledgment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestDiff {
    pub paths: Vec<String>,
    pub hashes: Vec<String>,
    /// `news[i]` is true when `paths[i]` is unknown to the service
    pub news: Vec<bool>,
    pub file_ids: Vec<RemoteId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationResult {
    Covered {
        manifest_record_id: RemoteId,
        diff: ManifestDiff,
    },
    NotCovered {
        manifest_record_id: RemoteId,
        upload_credential: UploadCredential,
        new_file_ids: Vec<RemoteId>,
        new_file_paths: Vec<String>,
        diff: ManifestDiff,
    },
    Failed {
        kind: FailureKind,
        reason: String,
    },
}

impl ReconciliationResult {
    fn rejected(reason: impl Into<String>) -> Self {
        ReconciliationResult::Failed {
            kind: FailureKind::Rejected,
            reason: reason.into(),
        }
    }
}

impl From<ApiError> for ReconciliationResult {
    fn from(err: ApiError) -> Self {
        let kind = if err.is_transport() {
            FailureKind::Transport
        } else {
            FailureKind::Rejected
        };
        ReconciliationResult::Failed {
            kind,
            reason: err.to_string(),
        }
    }
}

pub struct ReconciliationClient<'a> {
    api: &'a dyn CoverageApi,
}

impl<'a> ReconciliationClient<'a> {
    pub fn new(api: &'a dyn CoverageApi) -> Self {
        Self { api }
    }

    pub async fn check_manifest(&self, manifest: &Manifest, api_key: &str) -> ReconciliationResult {
        let correlation_id = Uuid::new_v4().to_string();
        info!(
            "Checking manifest of {} files (correlation id {})",
            manifest.len(),
            correlation_id
        );

        match self.api.check_manifest(manifest, api_key, &correlation_id).await {
            Ok(response) => interpret(response, manifest),
            Err(e) => {
                warn!("Manifest check failed: {}", e);
                e.into()
            }
        }
    }
}

/// Turn a raw `check-manifest` response into a coverage decision.
pub fn interpret(response: ManifestCheckResponse, manifest: &Manifest) -> ReconciliationResult {
    let Some(manifest_record_id) = response.manifest_id else {
        return ReconciliationResult::rejected("response has no manifest id");
    };
    let Some(covered) = response.covered else {
        return ReconciliationResult::rejected("response has no coverage field");
    };

    // Services that do not echo the manifest are diffed against our own copy
    let (paths, hashes) = if response.paths.is_empty() {
        (manifest.paths().to_vec(), manifest.hashes().to_vec())
    } else {
        (response.paths, response.hashes)
    };
    if paths.len() != hashes.len() {
        return ReconciliationResult::rejected(format!(
            "response lists {} paths but {} hashes",
            paths.len(),
            hashes.len()
        ));
    }

    if let Some(news) = &response.news {
        if news.len() != paths.len() {
            return ReconciliationResult::rejected(format!(
                "{} new-file markers for {} paths",
                news.len(),
                paths.len()
            ));
        }
    }

    if covered {
        let news = response.news.unwrap_or_else(|| vec![false; paths.len()]);
        return ReconciliationResult::Covered {
            manifest_record_id,
            diff: ManifestDiff {
                paths,
                hashes,
                news,
                file_ids: response.file_ids.unwrap_or_default(),
            },
        };
    }

    let Some(upload_credential) = response.upload else {
        return ReconciliationResult::rejected("manifest not covered but no upload credential");
    };
    let Some(news) = response.news else {
        return ReconciliationResult::rejected("manifest not covered but no new-file markers");
    };
    let Some(file_ids) = response.file_ids else {
        return ReconciliationResult::rejected("manifest not covered but no new-file ids");
    };

    let new_file_paths: Vec<String> = paths
        .iter()
        .zip(&news)
        .filter(|(_, is_new)| **is_new)
        .map(|(path, _)| path.clone())
        .collect();

    // New files must come from this manifest; the agent uploads nothing else
    let known: HashSet<&str> = manifest.paths().iter().map(String::as_str).collect();
    if let Some(stray) = new_file_paths.iter().find(|path| !known.contains(path.as_str())) {
        return ReconciliationResult::rejected(format!(
            "new file {} is not part of the manifest",
            stray
        ));
    }

    ReconciliationResult::NotCovered {
        manifest_record_id,
        upload_credential,
        new_file_ids: file_ids.clone(),
        new_file_paths,
        diff: ManifestDiff {
            paths,
            hashes,
            news,
            file_ids,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{UploadAck, UploadAckResponse};
    use crate::executor::manifest::{FileRecord, ManifestBuilder};
    use std::sync::Mutex;

    fn manifest() -> Manifest {
        let mut builder = ManifestBuilder::new();
        for (i, path) in ["/srv/a.php", "/srv/b.php", "/srv/c.php"].iter().enumerate() {
            builder.add_record(FileRecord {
                path: path.to_string(),
                size_bytes: 10,
                content_hash: format!("h{}", i),
            });
        }
        builder.finish()
    }

    fn response(json: serde_json::Value) -> ManifestCheckResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_covered() {
        let result = interpret(response(serde_json::json!({"manifest_id": 4, "covered": true})), &manifest());

        match result {
            ReconciliationResult::Covered { manifest_record_id, diff } => {
                assert_eq!(manifest_record_id, RemoteId::Number(4));
                assert_eq!(diff.paths.len(), 3);
                assert_eq!(diff.news, vec![false; 3]);
            }
            other => panic!("expected Covered, got {:?}", other),
        }
    }

    #[test]
    fn test_not_covered_selects_new_paths() {
        let result = interpret(
            response(serde_json::json!({
                "manifest_id": "m-1",
                "covered": false,
                "upload": {"bucket": "scans", "region": "eu-west-1"},
                "paths": ["/srv/a.php", "/srv/b.php", "/srv/c.php"],
                "hashes": ["h0", "h1", "h2"],
                "news": [true, false, true],
                "file_ids": [11, 13]
            })),
            &manifest(),
        );

        match result {
            ReconciliationResult::NotCovered {
                new_file_paths,
                new_file_ids,
                upload_credential,
                diff,
                ..
            } => {
                assert_eq!(new_file_paths, vec!["/srv/a.php", "/srv/c.php"]);
                assert_eq!(new_file_ids, vec![RemoteId::Number(11), RemoteId::Number(13)]);
                assert_eq!(upload_credential.bucket.as_deref(), Some("scans"));
                assert_eq!(diff.news, vec![true, false, true]);
            }
            other => panic!("expected NotCovered, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_coverage_field() {
        let result = interpret(response(serde_json::json!({"manifest_id": 4})), &manifest());
        assert_eq!(
            result,
            ReconciliationResult::Failed {
                kind: FailureKind::Rejected,
                reason: "response has no coverage field".to_string()
            }
        );
    }

    #[test]
    fn test_not_covered_requires_markers_and_credential() {
        let no_credential = interpret(
            response(serde_json::json!({"manifest_id": 4, "covered": false, "news": [true, true, true], "file_ids": []})),
            &manifest(),
        );
        assert!(matches!(no_credential, ReconciliationResult::Failed { kind: FailureKind::Rejected, .. }));

        // Older contract without explicit new-file lists is not accepted
        let no_news = interpret(
            response(serde_json::json!({"manifest_id": 4, "covered": false, "upload": {"bucket": "b", "region": "r"}})),
            &manifest(),
        );
        assert!(matches!(no_news, ReconciliationResult::Failed { .. }));

        let short_news = interpret(
            response(serde_json::json!({
                "manifest_id": 4, "covered": false,
                "upload": {"bucket": "b", "region": "r"},
                "news": [true], "file_ids": [1]
            })),
            &manifest(),
        );
        assert!(matches!(short_news, ReconciliationResult::Failed { .. }));
    }

    #[test]
    fn test_new_paths_outside_manifest_rejected() {
        let result = interpret(
            response(serde_json::json!({
                "manifest_id": 4,
                "covered": false,
                "upload": {"bucket": "b", "region": "r"},
                "paths": ["/elsewhere/x.php"],
                "hashes": ["hx"],
                "news": [true],
                "file_ids": [1]
            })),
            &manifest(),
        );

        match result {
            ReconciliationResult::Failed { kind, reason } => {
                assert_eq!(kind, FailureKind::Rejected);
                assert!(reason.contains("/elsewhere/x.php"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_covered_checks_marker_length() {
        let result = interpret(
            response(serde_json::json!({"manifest_id": 4, "covered": true, "news": [false]})),
            &manifest(),
        );
        assert!(matches!(result, ReconciliationResult::Failed { kind: FailureKind::Rejected, .. }));
    }

    struct RecordingApi {
        correlation_ids: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CoverageApi for RecordingApi {
        async fn check_manifest(
            &self,
            _manifest: &Manifest,
            _api_key: &str,
            correlation_id: &str,
        ) -> Result<ManifestCheckResponse, ApiError> {
            self.correlation_ids.lock().unwrap().push(correlation_id.to_string());
            if self.fail {
                return Err(ApiError::Status {
                    status: 503,
                    body: "maintenance".to_string(),
                });
            }
            Ok(response(serde_json::json!({"manifest_id": 1, "covered": true})))
        }

        async fn acknowledge_upload(&self, _ack: &UploadAck) -> Result<UploadAckResponse, ApiError> {
            unreachable!()
        }

        async fn job_status(&self, _report_uri: &str, _api_key: &str) -> Result<String, ApiError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_fresh_correlation_id_per_request() {
        let api = RecordingApi {
            correlation_ids: Mutex::new(Vec::new()),
            fail: false,
        };
        let client = ReconciliationClient::new(&api);
        let manifest = manifest();

        client.check_manifest(&manifest, "key1").await;
        client.check_manifest(&manifest, "key1").await;

        let ids = api.correlation_ids.lock().unwrap().clone();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(Uuid::parse_str(&ids[0]).is_ok());
    }

    #[tokio::test]
    async fn test_error_status_is_single_failed_attempt() {
        let api = RecordingApi {
            correlation_ids: Mutex::new(Vec::new()),
            fail: true,
        };
        let result = ReconciliationClient::new(&api).check_manifest(&manifest(), "key1").await;

        assert!(matches!(result, ReconciliationResult::Failed { kind: FailureKind::Rejected, .. }));
        assert_eq!(api.correlation_ids.lock().unwrap().len(), 1);
    }
}
