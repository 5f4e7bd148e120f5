//! Directory traversal for scan candidates.
//!
//! Unreadable entries are skipped rather than aborting the walk, and
//! siblings are visited in file-name order so runs over the same tree
//! see files in the same sequence.

use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Exclude patterns (matched against each path component's name)
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                ".DS_Store".to_string(),
            ],
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None for directories, symlinks to directories and broken links.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = raw_metadata.is_symlink();

        let size = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                _ => return Ok(None),
            }
        } else if raw_metadata.is_file() {
            raw_metadata.len()
        } else {
            return Ok(None);
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
            is_symlink,
        }))
    }
}

/// Walk a directory tree and collect all regular files
///
/// # Arguments
/// * `root` - Root directory to start walking from
/// * `options` - Walking options (filters, depth, etc.)
///
/// # Returns
/// * `Ok(Vec<FileInfo>)` - List of all files found
/// * `Err(io::Error)` - If the root itself cannot be read
///
/// # Example
/// ```no_run
/// use scan_agent::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/var/www"), WalkOptions::default()).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    std::fs::read_dir(root)?;

    let mut files = Vec::new();

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let patterns = options.exclude_patterns;
    let entries = walker
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !should_exclude(entry, &patterns));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        match FileInfo::from_entry(&entry, root) {
            Ok(Some(file_info)) => files.push(file_info),
            Ok(None) => {}
            Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
        }
    }

    Ok(files)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name == pattern.as_str())
}
