//! Utility modules for the scan agent.

pub mod errors;
pub mod logger;

pub use errors::{ErrorCategory, Result, ScanError};
