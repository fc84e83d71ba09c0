// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client and server configuration.
//!
//! Both sides can be configured from JSON files; every field has a default,
//! so a partial file is valid.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::policy::DEFAULT_DROP_EVERY;

/// Heartbeat client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or IP (default: localhost)
    #[serde(default = "default_host")]
    pub server_address: String,

    /// Server TCP port (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval between heartbeats in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Time after which an unanswered heartbeat counts as lost (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on a single receiver wait; expiring is not an error (milliseconds)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Stop after this many heartbeats and drain (None = run until shutdown)
    #[serde(default)]
    pub max_heartbeats: Option<u64>,
}

/// Heartbeat server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host name or IP (default: localhost)
    #[serde(default = "default_host")]
    pub listen_address: String,

    /// TCP port to listen on; 0 picks an ephemeral port (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Drop every n-th heartbeat id (0 = answer everything)
    #[serde(default = "default_drop_every")]
    pub drop_every: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_drop_every() -> u32 {
    DEFAULT_DROP_EVERY
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: default_host(),
            port: default_port(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_heartbeats: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_host(),
            port: default_port(),
            drop_every: default_drop_every(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// `host:port` of the server.
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.port)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_address.is_empty() {
            return Err(ConfigError::InvalidValue(
                "server_address cannot be empty".into(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::InvalidValue("interval_ms cannot be 0".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("timeout_ms cannot be 0".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "read_timeout_ms cannot be 0".into(),
            ));
        }
        if self.max_heartbeats == Some(0) {
            return Err(ConfigError::InvalidValue(
                "max_heartbeats cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    /// `host:port` to bind.
    pub fn listen_endpoint(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.is_empty() {
            return Err(ConfigError::InvalidValue(
                "listen_address cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
