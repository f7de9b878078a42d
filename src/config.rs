//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{LogDumpError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Log download configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    #[serde(default = "default_max_rerequests")]
    pub max_rerequests: usize,

    #[serde(default = "default_report_file")]
    pub report_file: String,
}

/// Log dump workflow configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DumpConfig {
    #[serde(default = "default_ready_text")]
    pub ready_text: String,

    #[serde(default = "default_fast_sched_rate")]
    pub fast_sched_rate: u16,

    #[serde(default = "default_sched_rate")]
    pub default_sched_rate: u16,

    #[serde(default = "default_param_backup")]
    pub param_backup: String,
}

/// Scheduler loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub log_dir: String,
}

/// Simulated flight controller configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SimulatorConfig {
    #[serde(default = "default_log_sizes")]
    pub log_sizes: Vec<u32>,

    #[serde(default)]
    pub drop_every: u32,

    #[serde(default = "default_sched_rate")]
    pub sched_rate: u16,

    #[serde(default = "default_reboot_delay_polls")]
    pub reboot_delay_polls: u32,

    #[serde(default = "default_status_every_polls")]
    pub status_every_polls: u32,
}

// Default value functions
fn default_output_dir() -> String { ".".to_string() }
fn default_retry_interval_ms() -> u64 { 700 }
fn default_status_interval_ms() -> u64 { 500 }
fn default_max_rerequests() -> usize { 20 }
fn default_report_file() -> String { "downloads.jsonl".to_string() }

fn default_ready_text() -> String { "PreArm: Waiting for RC".to_string() }
fn default_fast_sched_rate() -> u16 { 300 }
fn default_sched_rate() -> u16 { 50 }
fn default_param_backup() -> String { "after_flight.param".to_string() }

fn default_tick_interval_ms() -> u64 { 100 }

fn default_log_level() -> String { "info".to_string() }

fn default_log_sizes() -> Vec<u32> { vec![300, 4000, 25000] }
fn default_reboot_delay_polls() -> u32 { 20 }
fn default_status_every_polls() -> u32 { 10 }

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            retry_interval_ms: default_retry_interval_ms(),
            status_interval_ms: default_status_interval_ms(),
            max_rerequests: default_max_rerequests(),
            report_file: default_report_file(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            ready_text: default_ready_text(),
            fast_sched_rate: default_fast_sched_rate(),
            default_sched_rate: default_sched_rate(),
            param_backup: default_param_backup(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: String::new(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            log_sizes: default_log_sizes(),
            drop_every: 0,
            sched_rate: default_sched_rate(),
            reboot_delay_polls: default_reboot_delay_polls(),
            status_every_polls: default_status_every_polls(),
        }
    }
}

impl DownloadConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

impl RuntimeConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn invalid(message: impl std::fmt::Display) -> LogDumpError {
    LogDumpError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fpv_logdump::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.download.output_dir.is_empty() {
            return Err(invalid("output_dir cannot be empty"));
        }

        if self.download.retry_interval_ms == 0 || self.download.retry_interval_ms > 60000 {
            return Err(invalid("retry_interval_ms must be between 1 and 60000"));
        }

        if self.download.status_interval_ms == 0 || self.download.status_interval_ms > 60000 {
            return Err(invalid("status_interval_ms must be between 1 and 60000"));
        }

        // Re-requests are rate limited so a retry wave cannot flood the link
        if self.download.max_rerequests == 0 || self.download.max_rerequests > 255 {
            return Err(invalid("max_rerequests must be between 1 and 255"));
        }

        if self.dump.ready_text.is_empty() {
            return Err(invalid("ready_text cannot be empty"));
        }

        if self.dump.param_backup.is_empty() {
            return Err(invalid("param_backup cannot be empty"));
        }

        // SCHED_LOOP_RATE accepts 50-400 Hz
        for (name, value) in [
            ("fast_sched_rate", self.dump.fast_sched_rate),
            ("default_sched_rate", self.dump.default_sched_rate),
            ("simulator sched_rate", self.simulator.sched_rate),
        ] {
            if !(50..=400).contains(&value) {
                return Err(invalid(format!("{} must be between 50 and 400", name)));
            }
        }

        if self.runtime.tick_interval_ms == 0 || self.runtime.tick_interval_ms > 100 {
            return Err(invalid("tick_interval_ms must be between 1 and 100"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        if self.simulator.status_every_polls == 0 {
            return Err(invalid("status_every_polls must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.download.retry_interval(), Duration::from_millis(700));
        assert_eq!(config.download.status_interval(), Duration::from_millis(500));
        assert_eq!(config.download.max_rerequests, 20);
        assert_eq!(config.dump.ready_text, "PreArm: Waiting for RC");
        assert_eq!(config.dump.fast_sched_rate, 300);
        assert_eq!(config.dump.param_backup, "after_flight.param");
        assert_eq!(config.runtime.tick_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.download.output_dir, ".");
        assert_eq!(config.simulator.log_sizes, vec![300, 4000, 25000]);
    }

    #[test]
    fn test_invalid_tick_interval() {
        let mut config = Config::default();
        config.runtime.tick_interval_ms = 500;
        assert!(config.validate().is_err());

        config.runtime.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_retry_interval() {
        let mut config = Config::default();
        config.download.retry_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_max_rerequests() {
        let mut config = Config::default();
        config.download.max_rerequests = 0;
        assert!(config.validate().is_err());

        config.download.max_rerequests = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sched_rate() {
        let mut config = Config::default();
        config.dump.fast_sched_rate = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fast_sched_rate"));
    }

    #[test]
    fn test_invalid_ready_text() {
        let mut config = Config::default();
        config.dump.ready_text.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparsable_toml() {
        let result = Config::parse("[download\nretry_interval_ms = ");
        assert!(matches!(result, Err(LogDumpError::Config(_))));
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[download]
output_dir = "/tmp/logs"
retry_interval_ms = 1000

[dump]
fast_sched_rate = 400

[simulator]
log_sizes = [90, 181]
drop_every = 7
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.download.output_dir, "/tmp/logs");
        assert_eq!(config.download.retry_interval_ms, 1000);
        assert_eq!(config.download.status_interval_ms, 500);
        assert_eq!(config.dump.fast_sched_rate, 400);
        assert_eq!(config.simulator.log_sizes, vec![90, 181]);
        assert_eq!(config.simulator.drop_every, 7);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/fpv-logdump.toml");
        assert!(matches!(result, Err(LogDumpError::Io(_))));
    }
}
