// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Fnflow Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Host of the function runtime the executor dispatches to
    pub runtime_host: String,
    /// Port of the function runtime
    pub runtime_port: u16,
    /// Checkpoint the graph state every N journal events
    pub snapshot_interval: u64,
    /// Passivate graph actors idle for longer than this
    pub idle_window: Duration,
    /// Dispatch attempts per stage invocation (first try + retries)
    pub max_dispatch_attempts: u32,
    /// Base delay of the executor's exponential backoff
    pub dispatch_backoff: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FNFLOW_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `FNFLOW_RUNTIME_HOST`: function runtime host (default: localhost)
    /// - `FNFLOW_RUNTIME_PORT`: function runtime port (default: 8080)
    /// - `FNFLOW_SNAPSHOT_INTERVAL`: events between snapshots (default: 100)
    /// - `FNFLOW_IDLE_SECS`: actor passivation window in seconds (default: 300)
    /// - `FNFLOW_DISPATCH_ATTEMPTS`: dispatch attempts per invocation (default: 3)
    /// - `FNFLOW_DISPATCH_BACKOFF_MS`: base backoff in milliseconds (default: 50)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FNFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FNFLOW_DATABASE_URL"))?;

        let runtime_host =
            std::env::var("FNFLOW_RUNTIME_HOST").unwrap_or_else(|_| "localhost".to_string());

        let runtime_port: u16 = std::env::var("FNFLOW_RUNTIME_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("FNFLOW_RUNTIME_PORT", "must be a valid port"))?;

        let snapshot_interval: u64 = std::env::var("FNFLOW_SNAPSHOT_INTERVAL")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FNFLOW_SNAPSHOT_INTERVAL", "must be a positive integer")
            })?;
        if snapshot_interval == 0 {
            return Err(ConfigError::Invalid(
                "FNFLOW_SNAPSHOT_INTERVAL",
                "must be a positive integer",
            ));
        }

        let idle_secs: u64 = std::env::var("FNFLOW_IDLE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("FNFLOW_IDLE_SECS", "must be a positive integer"))?;

        let max_dispatch_attempts: u32 = std::env::var("FNFLOW_DISPATCH_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FNFLOW_DISPATCH_ATTEMPTS", "must be a positive integer")
            })?;

        let backoff_ms: u64 = std::env::var("FNFLOW_DISPATCH_BACKOFF_MS")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FNFLOW_DISPATCH_BACKOFF_MS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            runtime_host,
            runtime_port,
            snapshot_interval,
            idle_window: Duration::from_secs(idle_secs),
            max_dispatch_attempts,
            dispatch_backoff: Duration::from_millis(backoff_ms),
        })
    }

    /// Base URL the executor posts stage invocations to, without the
    /// trailing function id.
    pub fn runtime_base_url(&self) -> String {
        format!("http://{}:{}/r", self.runtime_host, self.runtime_port)
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
