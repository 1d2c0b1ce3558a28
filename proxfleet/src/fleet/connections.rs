use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::inventory::Inventory;
use crate::pve::{Connector, Hypervisor};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("server '{0}' not found in inventory")]
    UnknownHost(String),
    #[error("connection to {host} failed: {reason}")]
    Failed { host: String, reason: String },
}

/// One connection per target host for the duration of one action.
///
/// Connections are opened on first use and memoized, failures included, so
/// a host that cannot be reached is tried once and every row that names it
/// gets the same error.
pub struct ConnectionCache {
    inventory: Inventory,
    connector: Arc<dyn Connector>,
    entries: HashMap<String, Result<Arc<dyn Hypervisor>, ConnectError>>,
}

impl ConnectionCache {
    pub fn new(inventory: Inventory, connector: Arc<dyn Connector>) -> Self {
        Self {
            inventory,
            connector,
            entries: HashMap::new(),
        }
    }

    pub fn knows(&self, host: &str) -> bool {
        self.inventory.get(host).is_some()
    }

    pub async fn get(&mut self, host: &str) -> Result<Arc<dyn Hypervisor>, ConnectError> {
        if let Some(entry) = self.entries.get(host) {
            return entry.clone();
        }
        let entry = self.open(host).await;
        self.entries.insert(host.to_string(), entry.clone());
        entry
    }

    async fn open(&self, host: &str) -> Result<Arc<dyn Hypervisor>, ConnectError> {
        let Some(server) = self.inventory.get(host) else {
            warn!(host, "server not found in inventory");
            return Err(ConnectError::UnknownHost(host.to_string()));
        };
        match self.connector.connect(server).await {
            Ok(conn) => {
                debug!(host, node = conn.node(), address = %server.address, "connected");
                Ok(conn)
            }
            Err(e) => {
                warn!(host, address = %server.address, error = %e, "failed to connect");
                Err(ConnectError::Failed {
                    host: host.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Connect to each distinct host up front, in first-seen order.
    pub async fn warm<'a>(&mut self, hosts: impl IntoIterator<Item = &'a str>) {
        for host in hosts {
            if host.is_empty() {
                continue;
            }
            let _ = self.get(host).await;
        }
    }

    /// Hosts with a live connection.
    pub fn connected(&self) -> usize {
        self.entries.values().filter(|e| e.is_ok()).count()
    }
}
