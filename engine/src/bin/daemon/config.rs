//! Daemon configuration from environment variables
//!
//! All configuration is read from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use sv_engine::domain::constants::DEFAULT_TICK_INTERVAL;
use sv_engine::DEFAULT_SOCKET;

const DEFAULT_LOG_LEVEL: &str = "info";

/// Daemon configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Control socket path
    pub socket: String,

    /// Config file path
    pub config_file: Option<String>,

    /// Config directory path
    pub config_dir: Option<String>,

    /// Supervision tick period
    pub tick_interval: Duration,

    /// Daemon log file; stderr when unset
    pub log_file: Option<String>,

    /// Log level
    pub log_level: String,
}

impl DaemonConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            socket: env::var("SV_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET.to_string()),
            config_file: env::var("SV_CONFIG_FILE").ok(),
            config_dir: env::var("SV_CONFIG_DIR").ok(),
            tick_interval: Self::parse_u64("SV_TICK_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TICK_INTERVAL),
            log_file: env::var("SV_LOG_FILE").ok().filter(|s| !s.is_empty()),
            log_level: Self::parse_log_level(),
        }
    }

    fn parse_u64(var_name: &str) -> Option<u64> {
        env::var(var_name).ok().and_then(|s| s.trim().parse().ok())
    }

    fn parse_log_level() -> String {
        // Priority: SV_LOG_LEVEL > RUST_LOG > default
        env::var("SV_LOG_LEVEL")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
    }

    /// Config source to load at startup, if any
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config_file
            .as_ref()
            .or(self.config_dir.as_ref())
            .map(PathBuf::from)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.config_file.is_some() && self.config_dir.is_some() {
            return Err("Cannot specify both SV_CONFIG_FILE and SV_CONFIG_DIR".to_string());
        }
        if self.socket.is_empty() {
            return Err("SV_SOCKET must not be empty".to_string());
        }
        Ok(())
    }
}
