//! Filesystem discovery: directory walking and source classification.

pub mod classifier;
pub mod source_parser;
pub mod walker;

pub use classifier::{Classification, FileClassifier, SourceClassifier};
pub use walker::{walk_directory, FileInfo, WalkOptions};
