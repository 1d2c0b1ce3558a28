use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use proxfleet_protocol::DEFAULT_API_PORT;
use serde::{Deserialize, Serialize};

use crate::net::Subnet;

/// Top-level configuration. Every field has a default, so the file is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub timeouts: TimeoutConfig,
    pub agent: AgentConfig,
    pub network: NetworkConfig,
    pub clone: CloneConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.api.port != 0, "api.port must be non-zero");
        anyhow::ensure!(
            self.api.request_timeout_secs >= 1,
            "api.request_timeout_secs must be >= 1"
        );
        for (name, poll, budget) in [
            ("clone", self.timeouts.clone_poll_secs, self.timeouts.clone_secs),
            ("start", self.timeouts.task_poll_secs, self.timeouts.start_secs),
            ("stop", self.timeouts.task_poll_secs, self.timeouts.stop_secs),
            ("delete", self.timeouts.task_poll_secs, self.timeouts.delete_secs),
        ] {
            anyhow::ensure!(poll >= 1, "timeouts: poll interval for {} must be >= 1", name);
            anyhow::ensure!(
                budget >= poll,
                "timeouts.{}_secs must be >= its poll interval",
                name
            );
        }
        anyhow::ensure!(self.agent.timeout_secs >= 1, "agent.timeout_secs must be >= 1");
        anyhow::ensure!(
            self.agent.ping_interval_secs >= 1,
            "agent.ping_interval_secs must be >= 1"
        );
        anyhow::ensure!(self.agent.ip_attempts >= 1, "agent.ip_attempts must be >= 1");
        anyhow::ensure!(
            !self.network.management_subnets.is_empty(),
            "network.management_subnets must not be empty"
        );
        anyhow::ensure!(
            crate::net::NIC_MODELS.contains(&self.network.default_nic_model.as_str()),
            "network.default_nic_model {:?} is not a known NIC model",
            self.network.default_nic_model
        );
        anyhow::ensure!(
            self.clone.max_concurrent_monitors >= 1,
            "clone.max_concurrent_monitors must be >= 1"
        );
        Ok(())
    }
}

/// Proxmox API connection settings shared by every server in the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Port used when an inventory entry has no explicit port.
    pub port: u16,
    /// Verify server certificates. Per-server `verify_tls` overrides this.
    pub verify_tls: bool,
    /// Timeout for a single HTTP request.
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_API_PORT,
            verify_tls: true,
            request_timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Wait budgets for hypervisor tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub clone_secs: u64,
    pub clone_poll_secs: u64,
    pub start_secs: u64,
    pub stop_secs: u64,
    pub delete_secs: u64,
    /// Poll interval for start, stop and delete tasks.
    pub task_poll_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            clone_secs: 900,
            clone_poll_secs: 5,
            start_secs: 60,
            stop_secs: 60,
            delete_secs: 120,
            task_poll_secs: 2,
        }
    }
}

/// Guest agent polling used when resolving management addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Per-row budget covering both the ping and the address phases.
    pub timeout_secs: u64,
    pub ping_interval_secs: u64,
    /// Maximum interface queries once the agent answers.
    pub ip_attempts: u32,
    pub ip_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 180,
            ping_interval_secs: 2,
            ip_attempts: 30,
            ip_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Management subnets in priority order.
    pub management_subnets: Vec<Subnet>,
    /// Model for a new NIC when no sibling NIC shows one.
    pub default_nic_model: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let subnets = ["192.168.140.0/23", "192.168.170.0/24", "192.168.176.0/24"];
        Self {
            management_subnets: subnets.iter().filter_map(|s| s.parse().ok()).collect(),
            default_nic_model: "virtio".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    /// Clone tasks polled at the same time.
    pub max_concurrent_monitors: usize,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self { max_concurrent_monitors: 32 }
    }
}
