//! Configuration module for the relay.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration values that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Exchange directory watched for new notification files
    pub input_dir: PathBuf,
    /// Directory receiving files that failed to ingest
    pub error_dir: PathBuf,
    /// Address to bind the HTTP API to
    pub bind_addr: SocketAddr,
    /// Pre-shared key for the device API (disabled when unset)
    pub api_psk: Option<String>,
    /// Push gateway endpoint; deliveries are only logged when unset
    pub push_gateway: Option<String>,
    pub dispatch: DispatchConfig,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,
}

/// Dispatch engine tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempts per device per notification before giving up
    pub delivery_attempts: u32,
    /// Delay before the first retry, doubled on each further retry
    pub retry_delay: Duration,
    /// Consecutive failures after which a device is deregistered
    pub failure_threshold: i64,
    /// Interval of the sweep that recovers notifications left in INPUT
    pub sweep_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            delivery_attempts: 3,
            retry_delay: Duration::from_millis(500),
            failure_threshold: 5,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let db_path = env::var("CLAND_DB_PATH")
            .unwrap_or_else(|_| "./data/cland.sqlite".to_string())
            .into();

        let input_dir = env::var("CLAND_INPUT_DIR")
            .unwrap_or_else(|_| "./tmp/input".to_string())
            .into();

        let error_dir = env::var("CLAND_ERROR_DIR")
            .unwrap_or_else(|_| "./tmp/error".to_string())
            .into();

        let bind_addr = parse_var("CLAND_BIND_ADDR", "127.0.0.1:8080")?;

        let api_psk = non_empty_var("CLAND_API_PSK");
        let push_gateway = non_empty_var("CLAND_PUSH_GATEWAY");

        let dispatch = DispatchConfig {
            delivery_attempts: parse_var("CLAND_DELIVERY_ATTEMPTS", "3")?,
            retry_delay: Duration::from_millis(parse_var("CLAND_DELIVERY_RETRY_MS", "500")?),
            failure_threshold: parse_var("CLAND_FAILURE_THRESHOLD", "5")?,
            sweep_interval: Duration::from_secs(parse_var("CLAND_SWEEP_INTERVAL_SECS", "60")?),
        };
        if dispatch.delivery_attempts == 0 {
            return Err(ConfigError {
                var: "CLAND_DELIVERY_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        if dispatch.failure_threshold < 1 {
            return Err(ConfigError {
                var: "CLAND_FAILURE_THRESHOLD",
                value: dispatch.failure_threshold.to_string(),
            });
        }
        if dispatch.sweep_interval.is_zero() {
            return Err(ConfigError {
                var: "CLAND_SWEEP_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        let log_level = env::var("CLAND_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = parse_var("CLAND_LOG_JSON", "false")?;

        Ok(Self {
            db_path,
            input_dir,
            error_dir,
            bind_addr,
            api_psk,
            push_gateway,
            dispatch,
            log_level,
            log_json,
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(var: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = env::var(var).unwrap_or_else(|_| default.to_string());
    value.trim().parse().map_err(|_| ConfigError { var, value })
}
