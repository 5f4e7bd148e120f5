//! Configuration management for the scan agent.
//!
//! Loads configuration from TOML file with environment variable overrides.
//! The resulting [`Config`] is handed to the orchestrator explicitly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{Result, ScanError};

const LOCAL_BASE_URL: &str = "http://localhost:8000";
const PROD_BASE_URL: &str = "https://phpscan.io";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Which deployment of the coverage service to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    #[default]
    Prod,
}

impl std::str::FromStr for Environment {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Environment::Local),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(ScanError::Config(format!("unknown environment '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Explicit base URL; overrides the environment's default
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Delay between job status requests
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,

    /// Status requests before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file location, used when `write_log` is set
    #[serde(default = "default_log_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub write_log: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// File or directory names skipped during the walk
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Size ceiling for files with an unrecognized extension
    #[serde(default = "default_max_unknown_size")]
    pub max_unknown_size: u64,
}

// Default values
fn default_timeout_secs() -> u64 {
    30
}

fn default_delay_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("scan-agent.log")
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        ".git".to_string(),
        "node_modules".to_string(),
        ".DS_Store".to_string(),
    ]
}

fn default_max_unknown_size() -> u64 {
    1024 * 1024 // 1MiB
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_delay_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl PollingConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: default_log_path(),
            write_log: false,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            max_unknown_size: default_max_unknown_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            environment: Environment::default(),
            service: ServiceConfig::default(),
            polling: PollingConfig::default(),
            log: LogConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ScanError::Config(e.to_string()))
    }

    /// Apply `SCAN_AGENT_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("SCAN_AGENT_ENV") {
            self.environment = env.parse()?;
        }
        if let Some(url) = lookup("SCAN_AGENT_BASE_URL") {
            self.service.base_url = Some(url);
        }
        if let Some(path) = lookup("SCAN_AGENT_LOG_PATH") {
            self.log.path = PathBuf::from(path);
        }
        if let Some(flag) = lookup("SCAN_AGENT_WRITE_LOG") {
            self.log.write_log = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(level) = lookup("SCAN_AGENT_LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    /// Base URL of the coverage service for the selected environment
    pub fn base_url(&self) -> &str {
        if let Some(url) = self.service.base_url.as_deref() {
            return url.trim_end_matches('/');
        }
        match self.environment {
            Environment::Local => LOCAL_BASE_URL,
            Environment::Prod => PROD_BASE_URL,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.service.timeout_secs)
    }
}
