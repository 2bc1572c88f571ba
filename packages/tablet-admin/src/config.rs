//! Configuration for the admin server and its clients
//!
//! Server settings load from a YAML file; every field has a default, so an
//! empty file (or no file) is a valid configuration. The server binary
//! overlays command-line flags on top.
//!
//! ```yaml
//! socket_path: /tmp/tablet-admin.sock
//! transition_delay_ms: 50
//! max_frame_bytes: 67108864
//! log_filter: info
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdminError, Result};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tablet-admin.sock";

/// Frames larger than this are rejected before the payload is read.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Time the transition worker takes to bring a table online or offline,
    /// standing in for cluster-wide tablet (un)assignment.
    pub transition_delay_ms: u64,
    pub max_frame_bytes: usize,
    /// `tracing-subscriber` filter directive, overridden by `RUST_LOG`.
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            transition_delay_ms: 0,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            log_filter: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(text)
            .map_err(|e| AdminError::invalid(format!("Invalid server config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn transition_delay(&self) -> Duration {
        Duration::from_millis(self.transition_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes == 0 {
            return Err(AdminError::invalid("max_frame_bytes must be positive"));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(AdminError::invalid("socket_path must not be empty"));
        }
        Ok(())
    }
}

/// Client-side knobs for `TableOperations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Interval between state polls while waiting on online/offline.
    pub wait_poll_interval_ms: u64,
    /// Give up waiting after this long and report a transport timeout.
    pub wait_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            wait_poll_interval_ms: 10,
            wait_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}
