//! Upload archive packaging.
//!
//! Files are packed into a zstd-compressed tar stream written to a temporary
//! file. Entry names are relative to the scan root, so the archive never
//! carries the local directory layout. The temporary file is removed when the
//! [`Archive`] is dropped, whichever way the upload step ends.

use crate::utils::errors::{Result, ScanError};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// zstd level used for archives
const COMPRESSION_LEVEL: i32 = 3;

/// A finished archive on local disk
#[derive(Debug)]
pub struct Archive {
    file: NamedTempFile,
    entries: usize,
    size: u64,
}

impl Archive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Compressed size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Archive-internal name for `path`: relative to `base_dir`, no `..`.
pub fn entry_name(base_dir: &Path, path: &Path) -> Result<PathBuf> {
    let relative = path.strip_prefix(base_dir).map_err(|_| {
        ScanError::Packaging(format!(
            "{} is outside {}",
            path.display(),
            base_dir.display()
        ))
    })?;

    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ScanError::Packaging(format!(
            "refusing to archive {}",
            path.display()
        )));
    }

    Ok(relative.to_path_buf())
}

/// Pack `files` (absolute paths under `base_dir`) into a new archive.
pub fn create_archive(base_dir: &Path, files: &[String]) -> Result<Archive> {
    let file = tempfile::Builder::new()
        .prefix("scan-agent-")
        .suffix(".tar.zst")
        .tempfile()
        .map_err(|e| ScanError::Packaging(format!("cannot create temporary archive: {}", e)))?;

    let encoder = zstd::Encoder::new(file.as_file(), COMPRESSION_LEVEL)
        .map_err(|e| ScanError::Packaging(e.to_string()))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    for source in files {
        let source = Path::new(source);
        let name = entry_name(base_dir, source)?;
        builder
            .append_path_with_name(source, &name)
            .map_err(|e| ScanError::Packaging(format!("{}: {}", source.display(), e)))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| ScanError::Packaging(e.to_string()))?;
    let written = encoder
        .finish()
        .map_err(|e| ScanError::Packaging(e.to_string()))?;
    written
        .sync_all()
        .map_err(|e| ScanError::Packaging(e.to_string()))?;

    let size = file
        .as_file()
        .metadata()
        .map_err(|e| ScanError::Packaging(e.to_string()))?
        .len();

    Ok(Archive {
        file,
        entries: files.len(),
        size,
    })
}
