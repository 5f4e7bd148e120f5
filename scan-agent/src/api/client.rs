//! HTTP client for the coverage service.

use super::{
    ApiError, CoverageApi, ManifestCheckRequest, ManifestCheckResponse, UploadAck,
    UploadAckResponse,
};
use crate::config::Config;
use crate::executor::manifest::Manifest;
use crate::utils::errors::{Result, ScanError};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Header carrying the per-request correlation token
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

const CHECK_MANIFEST_PATH: &str = "api/manifest/check";
const UPLOADED_PATH: &str = "api/manifest/uploaded";

/// reqwest-backed [`CoverageApi`]
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        // Trailing slash so relative joins append instead of replacing
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .map_err(|e| ScanError::Config(format!("invalid service URL '{}': {}", base_url, e)))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("scan-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, base_url })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.base_url(), config.request_timeout())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The underlying HTTP client, shared with upload transports
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Resolve a path or absolute URI against the base URL
    pub fn resolve(&self, uri: &str) -> std::result::Result<Url, ApiError> {
        self.base_url
            .join(uri.trim_start_matches('/'))
            .map_err(|e| ApiError::Malformed(format!("bad URI '{}': {}", uri, e)))
    }

    async fn post_json<B, R>(
        &self,
        url: Url,
        body: &B,
        correlation_id: Option<&str>,
    ) -> std::result::Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let text = self.post_text(url, body, correlation_id).await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Malformed(e.to_string()))
    }

    async fn post_text<B>(
        &self,
        url: Url,
        body: &B,
        correlation_id: Option<&str>,
    ) -> std::result::Result<String, ApiError>
    where
        B: Serialize + ?Sized,
    {
        debug!("POST {}", url);

        let mut request = self.http.post(url).json(body);
        if let Some(id) = correlation_id {
            request = request.header(CORRELATION_HEADER, id);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(status_error(status, text));
        }
        Ok(text)
    }
}

fn status_error(status: StatusCode, body: String) -> ApiError {
    ApiError::Status {
        status: status.as_u16(),
        body,
    }
}

#[async_trait::async_trait]
impl CoverageApi for ServiceClient {
    async fn check_manifest(
        &self,
        manifest: &Manifest,
        api_key: &str,
        correlation_id: &str,
    ) -> std::result::Result<ManifestCheckResponse, ApiError> {
        let url = self.resolve(CHECK_MANIFEST_PATH)?;
        let body = ManifestCheckRequest {
            api_key,
            request_id: correlation_id,
            manifest,
        };
        self.post_json(url, &body, Some(correlation_id)).await
    }

    async fn acknowledge_upload(
        &self,
        ack: &UploadAck,
    ) -> std::result::Result<UploadAckResponse, ApiError> {
        let url = self.resolve(UPLOADED_PATH)?;
        self.post_json(url, ack, None).await
    }

    async fn job_status(
        &self,
        report_uri: &str,
        api_key: &str,
    ) -> std::result::Result<String, ApiError> {
        let url = self.resolve(report_uri)?;
        let body = serde_json::json!({ "api_key": api_key });
        self.post_text(url, &body, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_and_absolute() {
        let client = ServiceClient::new("http://localhost:8000/scan", Duration::from_secs(5)).unwrap();

        assert_eq!(
            client.resolve("api/manifest/check").unwrap().as_str(),
            "http://localhost:8000/scan/api/manifest/check"
        );
        assert_eq!(
            client.resolve("/api/report/7").unwrap().as_str(),
            "http://localhost:8000/scan/api/report/7"
        );
        assert_eq!(
            client.resolve("https://reports.example.com/r/7").unwrap().as_str(),
            "https://reports.example.com/r/7"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = ServiceClient::new("not a url", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
    }
}
