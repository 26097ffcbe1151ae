//! Provisioning configuration

use crate::error::{ProvisionError, Result};
use crate::wait::PollConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Knobs for collection commands and the state-update consumer
///
/// # Example
///
/// ```toml
/// node_id = "overseer-1"
/// visibility_timeout_ms = 30000
/// poll_interval_ms = 100
/// active_timeout_ms = 120000
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisionConfig {
    /// Identity of the node running collection commands
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// How long to wait for a queued mutation to become visible
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_ms: u64,

    /// Sleep between polls of the cluster state
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long to wait for replicas to report ACTIVE
    #[serde(default = "default_active_timeout")]
    pub active_timeout_ms: u64,

    /// How long to wait for the colocation link on the companion collection
    #[serde(default = "default_colocation_timeout")]
    pub colocation_timeout_ms: u64,

    /// Batch timeout for remote core-admin calls
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Conditional write attempts before giving up on a contended record
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: usize,
}

fn default_node_id() -> String {
    format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

fn default_visibility_timeout() -> u64 {
    30000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_active_timeout() -> u64 {
    120000
}

fn default_colocation_timeout() -> u64 {
    5000
}

fn default_rpc_timeout() -> u64 {
    60000
}

fn default_max_cas_retries() -> usize {
    25
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            visibility_timeout_ms: default_visibility_timeout(),
            poll_interval_ms: default_poll_interval(),
            active_timeout_ms: default_active_timeout(),
            colocation_timeout_ms: default_colocation_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

impl ProvisionConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ProvisionError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ProvisionError::Config(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Polling for queued mutations to show up in the cluster state
    pub fn visibility_poll(&self) -> PollConfig {
        PollConfig::new(Duration::from_millis(self.visibility_timeout_ms), self.poll_interval())
    }

    /// Polling for replicas to report ACTIVE
    pub fn active_poll(&self) -> PollConfig {
        PollConfig::new(Duration::from_millis(self.active_timeout_ms), self.poll_interval())
    }

    /// Polling for the colocation link on a companion collection
    pub fn colocation_poll(&self) -> PollConfig {
        PollConfig::new(Duration::from_millis(self.colocation_timeout_ms), self.poll_interval())
    }
}
