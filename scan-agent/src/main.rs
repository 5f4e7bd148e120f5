//! Scan Agent - Main entry point
//!
//! Scans a directory once and prints where the analysis report can be found.

use anyhow::Result;
use clap::Parser;
use scan_agent::{config::Config, utils, ScanOrchestrator, ScanOutcome, TracingSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// API key issued by the service (letters and digits only)
    #[arg(short = 'k', long = "apikey", value_name = "KEY")]
    api_key: String,

    /// Directory to scan
    #[arg(short, long, value_name = "DIR")]
    dir: PathBuf,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Service environment (local, prod)
    #[arg(long)]
    env: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> scan_agent::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.apply_env_overrides()?;

    if let Some(env) = &args.env {
        config.environment = env.parse()?;
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(ExitCode::from(e.exit_code() as u8));
        }
    };

    // Initialize logging
    utils::logger::init(&config.log.level, &config.log)?;

    tracing::info!(
        "Starting scan-agent v{} against {} (run with --help for options)",
        env!("CARGO_PKG_VERSION"),
        config.base_url()
    );

    let orchestrator = match ScanOrchestrator::from_config(config, Arc::new(TracingSink)) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(ExitCode::from(e.exit_code() as u8));
        }
    };

    match orchestrator.run(&args.api_key, &args.dir).await {
        Ok(report) => {
            match report.outcome {
                ScanOutcome::NothingToScan => {
                    println!("No source files found under {}", args.dir.display())
                }
                ScanOutcome::ReportReady(url) => println!("Report ready: {}", url),
                ScanOutcome::TimedOut => println!(
                    "Analysis is still running; check the dashboard later for the report"
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Scan failed: {}", e);
            Ok(ExitCode::from(e.exit_code() as u8))
        }
    }
}
