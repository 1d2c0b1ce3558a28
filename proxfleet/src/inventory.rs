//! Server inventory: logical host name to Proxmox API address.
//!
//! ```yaml
//! servers:
//!   - host: pve1
//!     address: 10.0.0.11
//!   - host: pve2
//!     usmb-tri: pve2.lab.example.org
//!     port: 443
//!     verify_tls: false
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use proxfleet_protocol::API_PREFIX;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerEntry {
    pub host: String,
    #[serde(alias = "usmb-tri")]
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub verify_tls: Option<bool>,
}

impl ServerEntry {
    /// API root for this server. An address that already carries a scheme
    /// is used as-is, otherwise `https://{address}:{port}/api2/json`.
    pub fn base_url(&self, default_port: u16) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            if address.ends_with(API_PREFIX) {
                return address.to_string();
            }
            return format!("{address}{API_PREFIX}");
        }
        let port = self.port.unwrap_or(default_port);
        format!("https://{address}:{port}{API_PREFIX}")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading inventory: {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("parsing inventory: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let inventory: Inventory = serde_yaml::from_str(content)?;
        for (i, server) in inventory.servers.iter().enumerate() {
            anyhow::ensure!(!server.host.trim().is_empty(), "servers[{}].host is empty", i);
            anyhow::ensure!(
                !server.address.trim().is_empty(),
                "servers[{}].address is empty for host {}",
                i,
                server.host
            );
        }
        Ok(inventory)
    }

    pub fn get(&self, host: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.host == host)
    }
}
