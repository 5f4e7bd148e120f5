//! Source file classification.
//!
//! Two strategies decide whether a file is worth scanning:
//! - an O(1) extension allow-list, and
//! - a structural fallback for unknown extensions that parses the content and
//!   rejects files whose top-level statements are all literal markup.
//!
//! Classification is total: I/O and parse failures become
//! [`Classification::Unreadable`] or [`Classification::NotSource`], never errors.

use super::source_parser;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Extensions accepted without looking at the content
pub const SOURCE_EXTENSIONS: &[&str] = &["php", "php3", "php4", "php5", "php7", "phtml", "phps", "inc"];

/// Outcome of classifying one filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Source,
    NotSource,
    Unreadable,
}

impl Classification {
    pub fn is_source(self) -> bool {
        self == Classification::Source
    }
}

/// Strategy for deciding whether a file is a source file
pub trait SourceClassifier: Send + Sync {
    fn classify(&self, path: &Path, size: u64) -> Classification;
}

/// Accepts files by extension alone
#[derive(Debug, Clone)]
pub struct ExtensionClassifier {
    extensions: HashSet<String>,
}

impl ExtensionClassifier {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

impl Default for ExtensionClassifier {
    fn default() -> Self {
        Self::new(SOURCE_EXTENSIONS)
    }
}

impl SourceClassifier for ExtensionClassifier {
    fn classify(&self, path: &Path, _size: u64) -> Classification {
        if self.matches(path) {
            Classification::Source
        } else {
            Classification::NotSource
        }
    }
}

/// Parses the file content and inspects its top-level statements
#[derive(Debug, Clone)]
pub struct StructuralClassifier {
    max_size: u64,
}

impl StructuralClassifier {
    pub fn new(max_size: u64) -> Self {
        Self { max_size }
    }

    pub fn classify_bytes(&self, content: &[u8]) -> Classification {
        if !source_parser::has_open_tag(content) {
            return Classification::NotSource;
        }

        match source_parser::parse(content) {
            Ok(statements) if statements.iter().all(|s| s.is_inert()) => Classification::NotSource,
            Ok(_) => Classification::Source,
            Err(e) => {
                debug!("Content did not parse: {}", e);
                Classification::NotSource
            }
        }
    }
}

impl SourceClassifier for StructuralClassifier {
    fn classify(&self, path: &Path, size: u64) -> Classification {
        if size > self.max_size {
            return Classification::NotSource;
        }

        match std::fs::read(path) {
            Ok(content) => self.classify_bytes(&content),
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                Classification::Unreadable
            }
        }
    }
}

/// Extension fast path with the structural check as fallback
#[derive(Debug, Clone)]
pub struct FileClassifier {
    extensions: ExtensionClassifier,
    structural: StructuralClassifier,
}

impl FileClassifier {
    pub fn new(max_unknown_size: u64) -> Self {
        Self {
            extensions: ExtensionClassifier::default(),
            structural: StructuralClassifier::new(max_unknown_size),
        }
    }

    /// Classify a path, reading its size from the filesystem.
    pub fn is_source(&self, path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => self.classify(path, meta.len()).is_source(),
            _ => false,
        }
    }
}

impl Default for FileClassifier {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl SourceClassifier for FileClassifier {
    fn classify(&self, path: &Path, size: u64) -> Classification {
        if self.extensions.matches(path) {
            return Classification::Source;
        }
        self.structural.classify(path, size)
    }
}
