// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use steward_protocol::EndpointConfig;

use crate::application::ProcessConfig;
use crate::retry::RetryConfig;
use crate::server::ServerConfig;

/// Steward configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for `downloads/`, `install/` and `logs/`
    pub data_dir: PathBuf,
    /// Directory the filesystem downloader copies artifacts from
    pub drop_dir: PathBuf,
    /// Pipeline id handed to the monitor
    pub pipeline_id: String,
    /// Retry policy for operation blocks
    pub retry: RetryConfig,
    /// Process spawn/stop/restart tuning
    pub process: ProcessConfig,
    /// Control-plane server settings
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `STEWARD_CONTROL_ADDR`: control-plane bind address (default: 127.0.0.1:6789)
    /// - `STEWARD_DATA_DIR`: data root (default: .data)
    /// - `STEWARD_DROP_DIR`: artifact drop directory (default: `<data>/drop`)
    /// - `STEWARD_PIPELINE_ID`: pipeline id (default: default)
    /// - `STEWARD_RETRY_ENABLED` / `_COUNT` / `_DELAY_MS` / `_MAX_DELAY_MS` / `_EXPONENTIAL`
    /// - `STEWARD_STOP_TIMEOUT_MS`, `STEWARD_SPAWN_TIMEOUT_MS`
    /// - `STEWARD_RESTART_BURST`, `STEWARD_RESTART_REFILL_MS`
    /// - `STEWARD_CHECKIN_INITIAL_TIMEOUT_MS`, `STEWARD_CHECKIN_MIN_TIMEOUT_MS`
    /// - `STEWARD_WATCHDOG_INTERVAL_MS`, `STEWARD_ACTION_TIMEOUT_MS`
    ///
    /// QUIC transport tuning comes from [`EndpointConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr: SocketAddr = parse_var(
            "STEWARD_CONTROL_ADDR",
            SocketAddr::from(([127, 0, 0, 1], 6789)),
            "must be a socket address like 127.0.0.1:6789",
        )?;

        let data_dir = std::env::var("STEWARD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".data"));
        let drop_dir = std::env::var("STEWARD_DROP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("drop"));
        let pipeline_id =
            std::env::var("STEWARD_PIPELINE_ID").unwrap_or_else(|_| "default".to_string());

        let retry_default = RetryConfig::default();
        let retry = RetryConfig {
            enabled: parse_bool("STEWARD_RETRY_ENABLED", retry_default.enabled)?,
            retries_count: parse_var(
                "STEWARD_RETRY_COUNT",
                retry_default.retries_count,
                "must be a non-negative integer",
            )?,
            delay: parse_millis("STEWARD_RETRY_DELAY_MS", retry_default.delay)?,
            max_delay: parse_millis("STEWARD_RETRY_MAX_DELAY_MS", retry_default.max_delay)?,
            exponential: parse_bool("STEWARD_RETRY_EXPONENTIAL", retry_default.exponential)?,
        };

        let process_default = ProcessConfig::default();
        let process = ProcessConfig {
            stop_timeout: parse_millis("STEWARD_STOP_TIMEOUT_MS", process_default.stop_timeout)?,
            spawn_timeout: parse_millis(
                "STEWARD_SPAWN_TIMEOUT_MS",
                process_default.spawn_timeout,
            )?,
            restart_burst: parse_var(
                "STEWARD_RESTART_BURST",
                process_default.restart_burst,
                "must be a positive integer",
            )?,
            restart_refill: parse_millis(
                "STEWARD_RESTART_REFILL_MS",
                process_default.restart_refill,
            )?,
        };
        if process.restart_burst == 0 {
            return Err(ConfigError::Invalid(
                "STEWARD_RESTART_BURST",
                "must be a positive integer",
            ));
        }

        let server_default = ServerConfig::default();
        let server = ServerConfig {
            endpoint: EndpointConfig {
                bind_addr,
                ..EndpointConfig::from_env()
            },
            checkin_initial_timeout: parse_millis(
                "STEWARD_CHECKIN_INITIAL_TIMEOUT_MS",
                server_default.checkin_initial_timeout,
            )?,
            checkin_min_timeout: parse_millis(
                "STEWARD_CHECKIN_MIN_TIMEOUT_MS",
                server_default.checkin_min_timeout,
            )?,
            watchdog_interval: parse_millis(
                "STEWARD_WATCHDOG_INTERVAL_MS",
                server_default.watchdog_interval,
            )?,
            action_timeout: parse_millis(
                "STEWARD_ACTION_TIMEOUT_MS",
                server_default.action_timeout,
            )?,
        };
        if server.watchdog_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "STEWARD_WATCHDOG_INTERVAL_MS",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            data_dir,
            drop_dir,
            pipeline_id,
            retry,
            process,
            server,
        })
    }

    /// Where fetched artifacts land
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// Where artifacts are unpacked
    pub fn install_dir(&self) -> PathBuf {
        self.data_dir.join("install")
    }

    /// Where worker logs go
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

fn parse_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let ms: u64 = parse_var(
        key,
        default.as_millis() as u64,
        "must be a duration in milliseconds",
    )?;
    Ok(Duration::from_millis(ms))
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be true or false")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
