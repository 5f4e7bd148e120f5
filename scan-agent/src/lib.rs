//! Scan Agent Library
//!
//! Local agent for a remote source-analysis service: builds a
//! content-addressed manifest of source files, uploads only what the service
//! has not seen, and polls for the analysis report.

pub mod api;
pub mod config;
pub mod events;
pub mod executor;
pub mod fs;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use events::{EventSink, ScanEvent, TracingSink};
pub use executor::{ScanOrchestrator, ScanOutcome, ScanReport};
pub use utils::errors::{ErrorCategory, ScanError};
pub type Result<T> = std::result::Result<T, ScanError>;
