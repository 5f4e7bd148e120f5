//! Content-addressed scan manifest.
//!
//! A manifest lists every distinct file content found under the scan root as
//! three index-aligned sequences (hashes, sizes in MiB, absolute paths).
//! Identity is the composite hash, so two paths with the same bytes produce
//! one entry: the first one encountered.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use xxhash_rust::xxh3::Xxh3;

const BYTES_PER_MIB: f64 = 1_048_576.0;
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// One file as it enters the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub size_bytes: u64,
    pub content_hash: String,
}

/// Manifest sent to the coverage service
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Manifest {
    hashes: Vec<String>,
    sizes: Vec<f64>,
    paths: Vec<String>,
}

impl Manifest {
    fn push(&mut self, record: FileRecord) {
        self.hashes.push(record.content_hash);
        self.sizes.push(record.size_bytes as f64 / BYTES_PER_MIB);
        self.paths.push(record.path);
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn hashes(&self) -> &[String] {
        &self.hashes
    }

    /// Sizes in mebibytes
    pub fn sizes(&self) -> &[f64] {
        &self.sizes
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn total_mb(&self) -> f64 {
        self.sizes.iter().sum()
    }
}

/// Result of feeding one file to the builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResult {
    Added,
    Duplicate,
}

/// Incremental manifest construction with content dedup
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    seen: HashSet<String>,
    manifest: Manifest,
    duplicates: usize,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `path` and append it unless its content is already present.
    pub fn add_file(&mut self, path: &Path, size_bytes: u64) -> io::Result<AddResult> {
        let content_hash = composite_hash(path)?;
        Ok(self.add_record(FileRecord {
            path: path.to_string_lossy().to_string(),
            size_bytes,
            content_hash,
        }))
    }

    pub fn add_record(&mut self, record: FileRecord) -> AddResult {
        if !self.seen.insert(record.content_hash.clone()) {
            self.duplicates += 1;
            return AddResult::Duplicate;
        }
        self.manifest.push(record);
        AddResult::Added
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn finish(self) -> Manifest {
        self.manifest
    }
}

/// Summary of a full manifest build
#[derive(Debug, Default)]
pub struct BuildStats {
    pub duplicates: usize,
    /// Files that could not be hashed, with the reason
    pub skipped: Vec<(String, String)>,
}

/// Build a manifest from `(path, size)` pairs, preserving input order.
pub fn build<P: AsRef<Path>>(files: &[(P, u64)]) -> (Manifest, BuildStats) {
    let mut builder = ManifestBuilder::new();
    let mut skipped = Vec::new();

    for (path, size) in files {
        let path = path.as_ref();
        if let Err(e) = builder.add_file(path, *size) {
            skipped.push((path.display().to_string(), e.to_string()));
        }
    }

    let stats = BuildStats {
        duplicates: builder.duplicates(),
        skipped,
    };
    (builder.finish(), stats)
}

/// Composite content hash: xxh3-64, MD5 and SHA-256 hex digests concatenated.
pub fn composite_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = CompositeHasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

pub fn composite_hash_bytes(data: &[u8]) -> String {
    let mut hasher = CompositeHasher::new();
    hasher.update(data);
    hasher.finalize()
}

struct CompositeHasher {
    xxh3: Xxh3,
    md5: md5::Context,
    sha256: Sha256,
}

impl CompositeHasher {
    fn new() -> Self {
        Self {
            xxh3: Xxh3::new(),
            md5: md5::Context::new(),
            sha256: Sha256::new(),
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.xxh3.update(data);
        self.md5.consume(data);
        self.sha256.update(data);
    }

    fn finalize(self) -> String {
        format!(
            "{:016x}{:x}{}",
            self.xxh3.digest(),
            self.md5.compute(),
            hex::encode(self.sha256.finalize())
        )
    }
}
