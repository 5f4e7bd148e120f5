//! End-to-end runs against an in-process mock of the coverage service.

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{head, post};
use axum::{Json, Router};
use scan_agent::api::{CoverageApi, ServiceClient};
use scan_agent::events::MemorySink;
use scan_agent::executor::manifest::{Manifest, ManifestBuilder};
use scan_agent::transfer::{
    PackagerUploader, S3PutTransport, UploadCredential, UploadFailure, UploadOutcome,
};
use scan_agent::{Config, ScanError, ScanOrchestrator, ScanOutcome};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    NotCovered,
    Covered,
    Broken,
}

struct MockService {
    base: String,
    mode: Mode,
    correlation_ids: Mutex<Vec<String>>,
    checks: Mutex<Vec<Value>>,
    stored: Mutex<Vec<(String, Bytes)>>,
    acks: Mutex<Vec<Value>>,
    status_calls: Mutex<u32>,
}

type Shared = Arc<MockService>;

async fn check_manifest(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if let Some(id) = headers.get("x-correlation-id").and_then(|v| v.to_str().ok()) {
        mock.correlation_ids.lock().unwrap().push(id.to_string());
    }
    mock.checks.lock().unwrap().push(body.clone());

    let paths = body["manifest"]["paths"].clone();
    let count = paths.as_array().map(Vec::len).unwrap_or(0);
    let response = match mock.mode {
        Mode::Broken => return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "down"}))),
        Mode::Covered => json!({"manifest_id": 9, "covered": true}),
        Mode::NotCovered => json!({
            "manifest_id": 9,
            "covered": false,
            "upload": {
                "url": format!("{}/storage", mock.base),
                "fields": {"key": "9.tar.zst", "policy": "e30="}
            },
            "paths": paths,
            "hashes": body["manifest"]["hashes"].clone(),
            "news": vec![true; count],
            "file_ids": (1..=count).collect::<Vec<_>>(),
        }),
    };
    (StatusCode::OK, Json(response))
}

async fn storage_head() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn storage_post(State(mock): State<Shared>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    mock.stored.lock().unwrap().push((content_type, body));
    StatusCode::NO_CONTENT
}

async fn uploaded(State(mock): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    mock.acks.lock().unwrap().push(body);
    Json(json!({"job_id": 31, "report_uri": "/api/report/31"}))
}

async fn report(State(mock): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    if body["api_key"] != "key1" {
        return (StatusCode::UNAUTHORIZED, "bad key".to_string());
    }
    let mut calls = mock.status_calls.lock().unwrap();
    *calls += 1;
    if *calls < 3 {
        (StatusCode::OK, "\"processing\"".to_string())
    } else {
        (StatusCode::OK, format!("\"{}/report/31\"", mock.base))
    }
}

async fn spawn_service(mode: Mode) -> Shared {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let mock = Arc::new(MockService {
        base,
        mode,
        correlation_ids: Mutex::new(Vec::new()),
        checks: Mutex::new(Vec::new()),
        stored: Mutex::new(Vec::new()),
        acks: Mutex::new(Vec::new()),
        status_calls: Mutex::new(0),
    });

    let app = Router::new()
        .route("/api/manifest/check", post(check_manifest))
        .route("/api/manifest/uploaded", post(uploaded))
        .route("/api/report/{id}", post(report))
        .route("/storage", post(storage_post))
        .route("/storage/{key}", head(storage_head))
        .with_state(Arc::clone(&mock));

    tokio::spawn(async move { axum::serve(listener, app).await });
    mock
}

fn config_for(mock: &MockService) -> Config {
    let mut config = Config::default();
    config.service.base_url = Some(mock.base.clone());
    config.polling.delay_secs = 0;
    config.polling.max_attempts = 5;
    config
}

fn site() -> std::io::Result<TempDir> {
    let temp_dir = TempDir::new()?;
    let root = temp_dir.path();
    fs::create_dir_all(root.join("lib"))?;
    fs::write(root.join("index.php"), b"<?php require 'lib/util.php';")?;
    fs::write(root.join("lib/util.php"), b"<?php function util() { return 2; }")?;
    // Same bytes as index.php: dropped from the manifest
    fs::write(root.join("lib/copy.php"), b"<?php require 'lib/util.php';")?;
    fs::write(root.join("README.md"), b"# not source")?;
    Ok(temp_dir)
}

#[tokio::test]
async fn test_full_scan_uploads_and_reports() -> std::io::Result<()> {
    let mock = spawn_service(Mode::NotCovered).await;
    let temp_dir = site()?;
    let sink = Arc::new(MemorySink::new());

    let orchestrator = ScanOrchestrator::from_config(config_for(&mock), sink.clone()).unwrap();
    let report = orchestrator.run("key1", temp_dir.path()).await.unwrap();

    assert_eq!(
        report.outcome,
        ScanOutcome::ReportReady(format!("{}/report/31", mock.base))
    );
    assert!(report.uploaded);
    assert_eq!(report.files_discovered, 4);
    assert_eq!(report.manifest_entries, 2);

    let ids = mock.correlation_ids.lock().unwrap().clone();
    assert_eq!(ids.len(), 1);
    assert!(uuid::Uuid::parse_str(&ids[0]).is_ok());

    let checks = mock.checks.lock().unwrap().clone();
    assert_eq!(checks[0]["api_key"], "key1");
    assert_eq!(checks[0]["request_id"].as_str(), Some(ids[0].as_str()));
    let hashes = checks[0]["manifest"]["hashes"].as_array().unwrap();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes[0].as_str().unwrap().len(), 112);

    let stored = mock.stored.lock().unwrap().clone();
    assert_eq!(stored.len(), 1);
    let (content_type, body) = &stored[0];
    assert!(content_type.starts_with("multipart/form-data"));
    let text = String::from_utf8_lossy(body);
    let key_at = text.find("name=\"key\"").unwrap();
    let file_at = text.find("name=\"file\"").unwrap();
    assert!(key_at < file_at);

    let acks = mock.acks.lock().unwrap().clone();
    assert_eq!(acks[0]["storage_key"], "9.tar.zst");
    assert_eq!(acks[0]["covered"], false);
    assert_eq!(acks[0]["manifest_id"], 9);
    assert_eq!(acks[0]["news"], json!([true, true]));
    assert_eq!(acks[0]["file_ids"], json!([1, 2]));

    assert_eq!(*mock.status_calls.lock().unwrap(), 3);
    assert!(sink.kinds().contains(&"upload:completed"));
    Ok(())
}

#[tokio::test]
async fn test_covered_manifest_skips_storage() -> std::io::Result<()> {
    let mock = spawn_service(Mode::Covered).await;
    let temp_dir = site()?;

    let orchestrator =
        ScanOrchestrator::from_config(config_for(&mock), Arc::new(MemorySink::new())).unwrap();
    let report = orchestrator.run("key1", temp_dir.path()).await.unwrap();

    assert!(!report.uploaded);
    assert!(mock.stored.lock().unwrap().is_empty());
    let acks = mock.acks.lock().unwrap().clone();
    assert_eq!(acks[0]["storage_key"], Value::Null);
    assert_eq!(acks[0]["covered"], true);
    assert!(matches!(report.outcome, ScanOutcome::ReportReady(_)));
    Ok(())
}

#[tokio::test]
async fn test_service_error_aborts_before_upload() -> std::io::Result<()> {
    let mock = spawn_service(Mode::Broken).await;
    let temp_dir = site()?;
    let sink = Arc::new(MemorySink::new());

    let orchestrator = ScanOrchestrator::from_config(config_for(&mock), sink.clone()).unwrap();
    let err = orchestrator.run("key1", temp_dir.path()).await.unwrap_err();

    assert!(matches!(err, ScanError::RemoteRejection(_)));
    assert_eq!(err.exit_code(), 1);
    assert!(mock.acks.lock().unwrap().is_empty());
    assert_eq!(sink.kinds().last(), Some(&"scan:failed"));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_service_is_transport_failure() -> std::io::Result<()> {
    // Bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let base = format!("http://{}", listener.local_addr()?);
    drop(listener);

    let temp_dir = site()?;
    let mut config = Config::default();
    config.service.base_url = Some(base);
    config.service.timeout_secs = 2;

    let orchestrator = ScanOrchestrator::from_config(config, Arc::new(MemorySink::new())).unwrap();
    let err = orchestrator.run("key1", temp_dir.path()).await.unwrap_err();

    assert!(matches!(err, ScanError::Transport(_)));
    Ok(())
}

#[tokio::test]
async fn test_job_status_resolves_relative_uri() {
    let mock = spawn_service(Mode::Covered).await;
    let client = ServiceClient::new(&mock.base, Duration::from_secs(5)).unwrap();

    let first = client.job_status("/api/report/31", "key1").await.unwrap();
    assert_eq!(first, "\"processing\"");

    let absolute = format!("{}/api/report/31", mock.base);
    client.job_status(&absolute, "key1").await.unwrap();
    let ready = client.job_status(&absolute, "key1").await.unwrap();
    assert_eq!(ready, format!("\"{}/report/31\"", mock.base));
}

/// Path-style S3 endpoint: `HEAD /{bucket}`, `HEAD /{bucket}/{key}`, `PUT /{bucket}/{key}`
struct ObjectStore {
    base: String,
    buckets: HashSet<String>,
    objects: Mutex<HashSet<String>>,
    puts: Mutex<Vec<(String, usize)>>,
}

type Store = Arc<ObjectStore>;

async fn bucket_head(State(store): State<Store>, UrlPath(bucket): UrlPath<String>) -> StatusCode {
    if store.buckets.contains(&bucket) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn object_head(
    State(store): State<Store>,
    UrlPath((bucket, key)): UrlPath<(String, String)>,
) -> StatusCode {
    let name = format!("{}/{}", bucket, key);
    if store.objects.lock().unwrap().contains(&name) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn object_put(
    State(store): State<Store>,
    UrlPath((bucket, key)): UrlPath<(String, String)>,
    body: Bytes,
) -> StatusCode {
    if !store.buckets.contains(&bucket) {
        return StatusCode::NOT_FOUND;
    }
    let name = format!("{}/{}", bucket, key);
    store.puts.lock().unwrap().push((name.clone(), body.len()));
    store.objects.lock().unwrap().insert(name);
    StatusCode::OK
}

async fn spawn_object_store(stored: &[&str]) -> Store {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let store = Arc::new(ObjectStore {
        base,
        buckets: HashSet::from(["scans".to_string()]),
        objects: Mutex::new(stored.iter().map(|name| name.to_string()).collect()),
        puts: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/{bucket}", head(bucket_head))
        .route("/{bucket}/", head(bucket_head))
        .route("/{bucket}/{key}", head(object_head).put(object_put))
        .with_state(Arc::clone(&store));

    tokio::spawn(async move { axum::serve(listener, app).await });
    store
}

fn s3_transport(store: &ObjectStore, bucket: &str) -> S3PutTransport {
    let credential = UploadCredential {
        bucket: Some(bucket.to_string()),
        region: Some("us-east-1".to_string()),
        endpoint: Some(store.base.clone()),
        access_key_id: Some("AKIDTEST".to_string()),
        secret_access_key: Some("secret".to_string()),
        ..Default::default()
    };
    S3PutTransport::new(&credential, "9.tar.zst".to_string())
}

/// One-file manifest under a canonical base directory
fn one_file_site() -> std::io::Result<(TempDir, std::path::PathBuf, Manifest)> {
    let temp_dir = TempDir::new()?;
    fs::write(temp_dir.path().join("index.php"), b"<?php echo 'home';")?;
    let base = fs::canonicalize(temp_dir.path())?;
    let mut builder = ManifestBuilder::new();
    builder.add_file(&base.join("index.php"), 18)?;
    Ok((temp_dir, base, builder.finish()))
}

#[tokio::test]
async fn test_s3_existing_object_is_not_sent_again() -> std::io::Result<()> {
    let store = spawn_object_store(&["scans/9.tar.zst"]).await;
    let (_temp_dir, base, manifest) = one_file_site()?;
    let transport = s3_transport(&store, "scans");

    let outcome = PackagerUploader::new(Arc::new(MemorySink::new()))
        .package_and_upload(&manifest, manifest.paths(), &base, &transport)
        .await;

    assert_eq!(
        outcome,
        UploadOutcome::AlreadyPresent {
            key: "9.tar.zst".to_string()
        }
    );
    assert!(store.puts.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_s3_fresh_key_is_put_once() -> std::io::Result<()> {
    let store = spawn_object_store(&[]).await;
    let (_temp_dir, base, manifest) = one_file_site()?;
    let transport = s3_transport(&store, "scans");

    let outcome = PackagerUploader::new(Arc::new(MemorySink::new()))
        .package_and_upload(&manifest, manifest.paths(), &base, &transport)
        .await;

    match outcome {
        UploadOutcome::Done { key, bytes } => {
            assert_eq!(key, "9.tar.zst");
            assert!(bytes > 0);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let puts = store.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].0, "scans/9.tar.zst");
    Ok(())
}

#[tokio::test]
async fn test_s3_missing_bucket_fails_upload() -> std::io::Result<()> {
    let store = spawn_object_store(&[]).await;
    let (_temp_dir, base, manifest) = one_file_site()?;
    let transport = s3_transport(&store, "gone");

    assert!(!transport.bucket_exists().await.unwrap());

    let outcome = PackagerUploader::new(Arc::new(MemorySink::new()))
        .package_and_upload(&manifest, manifest.paths(), &base, &transport)
        .await;

    assert!(matches!(
        outcome,
        UploadOutcome::Failed {
            kind: UploadFailure::Transport,
            ..
        }
    ));
    assert!(matches!(outcome.into_result(), Err(ScanError::Upload(_))));
    assert!(store.puts.lock().unwrap().is_empty());
    Ok(())
}
