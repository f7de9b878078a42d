//! # FPV Logdump
//!
//! Retrieve flight logs from a flight controller, or run the unattended
//! "download everything, then erase" dump.
//!
//! Operator commands are read line by line from stdin:
//!
//! ```text
//! log list
//! log download all | latest [file] | <n> [file] | from <n> | range FIRST LAST
//! log status | log cancel | log resume | log erase | log dump
//! ```
//!
//! # Examples
//!
//! ```bash
//! cargo run --release -- config/default.toml
//! ```
//!
//! Expected output:
//! ```text
//! INFO fpv_logdump: FPV Logdump v0.1.0 starting...
//! INFO fpv_logdump::engine: Log 1  numLogs 3  lastLog 3  size 300 ...
//! INFO fpv_logdump::transfer::session: Finished downloading log1.bin (300 bytes 0 seconds, ...)
//! ```

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fpv_logdump::command::USAGE;
use fpv_logdump::config::{Config, LoggingConfig};
use fpv_logdump::engine::{EngineSettings, LogEngine};
use fpv_logdump::report::DownloadReport;
use fpv_logdump::sim::SimulatedDevice;
use fpv_logdump::sink::FileSinkProvider;

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// File name prefix of rolling log files
const LOG_FILE_PREFIX: &str = "fpv-logdump.log";

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("Failed to load config from {}", path)),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG_PATH)),
        None => Ok(Config::default()),
    }
}

/// Install the stdout subscriber, plus a daily rolling file when `log_dir` is set
///
/// The returned guard must be held until exit so buffered file output is flushed.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let level: tracing::Level = config
        .level
        .parse()
        .with_context(|| format!("Invalid log level {}", config.level))?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if config.log_dir.is_empty() {
        tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C");
}

/// Main entry point for FPV Logdump
///
/// Loads the configuration, installs logging, attaches the engine to the
/// simulated flight controller and runs the scheduler until Ctrl+C, or until
/// stdin is closed and all work is done.
///
/// # Errors
///
/// Returns error if:
/// - The configuration cannot be loaded or is invalid
/// - The download report cannot be opened
/// - Reading stdin fails
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config.logging)?;

    info!("FPV Logdump v{} starting...", env!("CARGO_PKG_VERSION"));

    let device = SimulatedDevice::from_config(&config.simulator, &config.dump.ready_text);
    info!("Attached to simulated flight controller with {} logs", device.logs().len());

    let sinks = FileSinkProvider::new(&config.download.output_dir);
    let report = if config.download.report_file.is_empty() {
        None
    } else {
        let path = Path::new(&config.download.output_dir).join(&config.download.report_file);
        Some(DownloadReport::open(&path).with_context(|| format!("Failed to open report {}", path.display()))?)
    };

    let mut engine = LogEngine::new(device, sinks, EngineSettings::from(&config));

    info!("{}", USAGE);
    fpv_logdump::app::run(
        &mut engine,
        BufReader::new(tokio::io::stdin()),
        config.runtime.tick_interval(),
        report,
        shutdown_signal(),
    )
    .await?;

    info!("FPV Logdump stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shipped_config_is_valid() {
        let config = Config::parse(include_str!("../config/default.toml")).unwrap();
        assert_eq!(config.runtime.tick_interval_ms, 100);
        assert_eq!(config.download.report_file, "downloads.jsonl");
        assert!(config.logging.log_dir.is_empty());
    }

    #[test]
    fn test_config_levels_parse() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(level.parse::<tracing::Level>().is_ok(), "{}", level);
        }
    }
}
