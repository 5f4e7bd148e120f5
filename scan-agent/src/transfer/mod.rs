//! Archive packaging and upload.

pub mod archive;
pub mod progress;
pub mod progress_stream;
pub mod upload;

pub use archive::{create_archive, Archive};
pub use upload::{
    DefaultTransportProvider, PresignedPostTransport, S3PutTransport, TransportProvider,
    UploadCredential, UploadTransport,
};

use crate::events::{EventSink, ScanEvent};
use crate::executor::manifest::Manifest;
use crate::utils::errors::ScanError;
use progress::format_bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Why an upload step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    /// Archive could not be built (disk space, permissions)
    Packaging,
    /// Storage unreachable, or the transfer broke off
    Transport,
    /// Storage refused the request
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Done { key: String, bytes: u64 },
    /// An object with the target key was already stored; nothing was sent
    AlreadyPresent { key: String },
    Failed { kind: UploadFailure, reason: String },
}

impl UploadOutcome {
    fn failed(kind: UploadFailure, err: ScanError) -> Self {
        UploadOutcome::Failed {
            kind,
            reason: err.to_string(),
        }
    }

    pub fn into_result(self) -> crate::Result<String> {
        match self {
            UploadOutcome::Done { key, .. } | UploadOutcome::AlreadyPresent { key } => Ok(key),
            UploadOutcome::Failed {
                kind: UploadFailure::Packaging,
                reason,
            } => Err(ScanError::Packaging(reason)),
            UploadOutcome::Failed {
                kind: UploadFailure::Rejected,
                reason,
            } => Err(ScanError::RemoteRejection(reason)),
            UploadOutcome::Failed { reason, .. } => Err(ScanError::Upload(reason)),
        }
    }
}

fn transport_failure(err: ScanError) -> UploadOutcome {
    let kind = match &err {
        ScanError::RemoteRejection(_) => UploadFailure::Rejected,
        ScanError::Http(e) if e.is_status() => UploadFailure::Rejected,
        _ => UploadFailure::Transport,
    };
    UploadOutcome::failed(kind, err)
}

/// Reject an upload list that is empty or names files outside the manifest
fn check_members(manifest: &Manifest, paths: &[String]) -> std::result::Result<(), String> {
    if paths.is_empty() {
        return Err("no new files to package".to_string());
    }
    let known: HashSet<&str> = manifest.paths().iter().map(String::as_str).collect();
    match paths.iter().find(|path| !known.contains(path.as_str())) {
        Some(stray) => Err(format!("{} is not part of the manifest", stray)),
        None => Ok(()),
    }
}

/// Packs new files and hands the archive to an [`UploadTransport`]
pub struct PackagerUploader {
    sink: Arc<dyn EventSink>,
}

impl PackagerUploader {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Package `new_file_paths` relative to `base_dir` and upload the result.
    ///
    /// `new_file_paths` must be a non-empty subset of `manifest`, otherwise
    /// nothing is packed or sent. The destination is checked first; an
    /// existing object short-circuits before any packaging work. Nothing is
    /// retried.
    pub async fn package_and_upload(
        &self,
        manifest: &Manifest,
        new_file_paths: &[String],
        base_dir: &Path,
        transport: &dyn UploadTransport,
    ) -> UploadOutcome {
        let key = transport.storage_key().to_string();
        if let Err(reason) = check_members(manifest, new_file_paths) {
            warn!("Refusing to upload {}: {}", key, reason);
            return UploadOutcome::Failed {
                kind: UploadFailure::Rejected,
                reason,
            };
        }
        let files = new_file_paths.to_vec();

        match transport.object_exists().await {
            Ok(true) => {
                info!("Archive {} already stored, skipping upload", key);
                self.sink.emit(ScanEvent::UploadSkipped { key: key.clone() });
                return UploadOutcome::AlreadyPresent { key };
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Existence check for {} failed: {}", key, e);
                return transport_failure(e);
            }
        }

        let base: PathBuf = base_dir.to_path_buf();
        let packaged = tokio::task::spawn_blocking(move || create_archive(&base, &files)).await;

        let archive = match packaged {
            Ok(Ok(archive)) => archive,
            Ok(Err(e)) => {
                error!("Packaging failed: {}", e);
                return UploadOutcome::failed(UploadFailure::Packaging, e);
            }
            Err(e) => return UploadOutcome::failed(UploadFailure::Packaging, e.into()),
        };

        info!(
            "Packaged {} files into {} ({})",
            archive.entries(),
            archive.path().display(),
            format_bytes(archive.size())
        );
        self.sink.emit(ScanEvent::ArchiveCreated {
            files: archive.entries(),
            bytes: archive.size(),
        });

        // `archive` is dropped at the end of this scope, removing the temp file
        match transport.put(archive.path(), archive.size()).await {
            Ok(()) => {
                self.sink.emit(ScanEvent::UploadCompleted {
                    key: key.clone(),
                    bytes: archive.size(),
                });
                UploadOutcome::Done {
                    key,
                    bytes: archive.size(),
                }
            }
            Err(e) => {
                error!("Upload of {} failed: {}", key, e);
                transport_failure(e)
            }
        }
    }
}
