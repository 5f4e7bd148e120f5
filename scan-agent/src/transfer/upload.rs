//! Upload transports.
//!
//! The service hands out one of two credential shapes and the agent picks the
//! matching transport from the fields present:
//! - `url` + `fields`: a pre-signed multipart form post
//! - `bucket` + `region`: an authenticated S3 `PutObject`

use super::progress::percent;
use super::progress_stream::{ProgressCallback, ProgressStream};
use crate::api::RemoteId;
use crate::events::{EventSink, ScanEvent};
use crate::utils::errors::{Result, ScanError};
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

const ARCHIVE_CONTENT_TYPE: &str = "application/zstd";

/// Storage credential issued by the coverage service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCredential {
    /// Form action URL (pre-signed post)
    #[serde(default, alias = "action")]
    pub url: Option<String>,
    /// Form fields to send ahead of the file (pre-signed post)
    #[serde(default)]
    pub fields: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Custom S3 endpoint (S3-compatible stores)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

/// Which transport a credential calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    PresignedPost,
    DirectPut,
}

impl UploadCredential {
    pub fn transport_kind(&self) -> Option<TransportKind> {
        if self.url.is_some() && self.fields.is_some() {
            Some(TransportKind::PresignedPost)
        } else if self.bucket.is_some() && self.region.is_some() {
            Some(TransportKind::DirectPut)
        } else {
            None
        }
    }

    /// Object key for this run's archive
    pub fn storage_key(&self, manifest_record_id: &RemoteId) -> String {
        self.fields
            .as_ref()
            .and_then(|fields| fields.get("key").cloned())
            .or_else(|| self.key.clone())
            .unwrap_or_else(|| format!("{}.tar.zst", manifest_record_id))
    }
}

/// Destination for the packaged archive
#[async_trait::async_trait]
pub trait UploadTransport: Send + Sync {
    fn storage_key(&self) -> &str;

    /// Is an object already stored under [`Self::storage_key`]?
    async fn object_exists(&self) -> Result<bool>;

    async fn put(&self, archive: &Path, size: u64) -> Result<()>;
}

/// Builds the transport a credential asks for
pub trait TransportProvider: Send + Sync {
    fn select(
        &self,
        credential: &UploadCredential,
        manifest_record_id: &RemoteId,
    ) -> Result<Box<dyn UploadTransport>>;
}

/// Picks [`PresignedPostTransport`] or [`S3PutTransport`] by credential shape
pub struct DefaultTransportProvider {
    http: reqwest::Client,
    sink: Arc<dyn EventSink>,
}

impl DefaultTransportProvider {
    pub fn new(http: reqwest::Client, sink: Arc<dyn EventSink>) -> Self {
        Self { http, sink }
    }
}

impl TransportProvider for DefaultTransportProvider {
    fn select(
        &self,
        credential: &UploadCredential,
        manifest_record_id: &RemoteId,
    ) -> Result<Box<dyn UploadTransport>> {
        let key = credential.storage_key(manifest_record_id);

        match credential.transport_kind() {
            Some(TransportKind::PresignedPost) => Ok(Box::new(PresignedPostTransport {
                http: self.http.clone(),
                url: credential.url.clone().unwrap_or_default(),
                fields: credential.fields.clone().unwrap_or_default(),
                key,
                sink: Arc::clone(&self.sink),
            })),
            Some(TransportKind::DirectPut) => Ok(Box::new(S3PutTransport::new(credential, key))),
            None => Err(ScanError::RemoteRejection(
                "upload credential has neither form fields nor bucket/region".to_string(),
            )),
        }
    }
}

/// Multipart form post to a pre-signed URL
pub struct PresignedPostTransport {
    http: reqwest::Client,
    url: String,
    fields: BTreeMap<String, String>,
    key: String,
    sink: Arc<dyn EventSink>,
}

impl PresignedPostTransport {
    fn object_url(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.key)
    }
}

#[async_trait::async_trait]
impl UploadTransport for PresignedPostTransport {
    fn storage_key(&self) -> &str {
        &self.key
    }

    async fn object_exists(&self) -> Result<bool> {
        let response = self
            .http
            .head(self.object_url())
            .send()
            .await
            .map_err(|e| ScanError::Upload(format!("existence check failed: {}", e)))?;

        // Anything but success (404, or 403 on private buckets) means absent
        debug!("HEAD {} -> {}", self.object_url(), response.status());
        Ok(response.status().is_success())
    }

    async fn put(&self, archive: &Path, size: u64) -> Result<()> {
        let file = tokio::fs::File::open(archive).await?;

        let sink = Arc::clone(&self.sink);
        let progress: ProgressCallback = Arc::new(move |transferred| {
            debug!("Upload {:.1}% done", percent(transferred, size));
            sink.emit(ScanEvent::UploadProgress {
                transferred_bytes: transferred,
                total_bytes: size,
            });
        });
        let stream = ProgressStream::new(ReaderStream::new(file), progress);

        let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), size)
            .file_name(self.key.clone())
            .mime_str(ARCHIVE_CONTENT_TYPE)?;

        // Policy fields must precede the file part
        let form = self
            .fields
            .iter()
            .fold(reqwest::multipart::Form::new(), |form, (name, value)| {
                form.text(name.clone(), value.clone())
            })
            .part("file", part);

        let response = self
            .http
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ScanError::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::RemoteRejection(format!(
                "storage returned {}: {}",
                status, body
            )));
        }

        info!("Posted archive to {} ({})", self.url, status);
        Ok(())
    }
}

/// Authenticated `PutObject` through the AWS SDK
pub struct S3PutTransport {
    bucket: String,
    region: String,
    key: String,
    endpoint: Option<String>,
    credentials: Option<Credentials>,
    client: OnceCell<aws_sdk_s3::Client>,
}

impl S3PutTransport {
    pub fn new(credential: &UploadCredential, key: String) -> Self {
        let credentials = match (&credential.access_key_id, &credential.secret_access_key) {
            (Some(access_key), Some(secret_key)) => Some(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                credential.session_token.clone(),
                None,
                "scan-agent",
            )),
            _ => None,
        };

        Self {
            bucket: credential.bucket.clone().unwrap_or_default(),
            region: credential.region.clone().unwrap_or_default(),
            key,
            endpoint: credential.endpoint.clone(),
            credentials,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &aws_sdk_s3::Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::from_env().region(Region::new(self.region.clone()));
                if let Some(endpoint) = &self.endpoint {
                    loader = loader.endpoint_url(endpoint);
                }
                if let Some(credentials) = &self.credentials {
                    loader = loader.credentials_provider(credentials.clone());
                }
                let shared = loader.load().await;

                let s3_config = aws_sdk_s3::config::Builder::from(&shared)
                    .force_path_style(self.endpoint.is_some())
                    .build();
                aws_sdk_s3::Client::from_conf(s3_config)
            })
            .await
    }

    pub async fn bucket_exists(&self) -> Result<bool> {
        match self.client().await.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(ScanError::Upload(format!("bucket check failed: {}", service_error)))
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl UploadTransport for S3PutTransport {
    fn storage_key(&self) -> &str {
        &self.key
    }

    async fn object_exists(&self) -> Result<bool> {
        if !self.bucket_exists().await? {
            return Err(ScanError::Upload(format!("bucket '{}' does not exist", self.bucket)));
        }

        let res = self
            .client()
            .await
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(ScanError::Upload(format!("object check failed: {}", service_error)))
                }
            }
        }
    }

    async fn put(&self, archive: &Path, size: u64) -> Result<()> {
        let body = ByteStream::from_path(archive)
            .await
            .map_err(|e| ScanError::Upload(format!("cannot read archive: {}", e)))?;

        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type(ARCHIVE_CONTENT_TYPE)
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| ScanError::Upload(format!("put failed: {}", e.into_service_error())))?;

        info!("Stored archive as s3://{}/{}", self.bucket, self.key);
        Ok(())
    }
}
