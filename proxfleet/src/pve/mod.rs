//! Proxmox VE access.
//!
//! [`Hypervisor`] is the per-host surface the orchestrator drives. The real
//! implementation is [`client::PveClient`] over the JSON REST API; tests use
//! an in-memory fake. A [`Connector`] turns an inventory entry into a live
//! `Arc<dyn Hypervisor>`.

pub mod auth;
pub mod client;
#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use proxfleet_protocol::{
    CloneParams, GuestInterface, NetworkIface, PoolEntry, PowerAction, StorageEntry, TaskStatus,
    Upid, VmConfig, VmEntry, VmStatus,
};

use crate::config::ApiConfig;
use crate::inventory::ServerEntry;

pub use auth::Credentials;
pub use client::PveClient;

/// Errors from the Proxmox API.
#[derive(Debug, thiserror::Error)]
pub enum PveError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("HTTP {status} on {path}: {message}")]
    Api {
        status: u16,
        path: String,
        message: String,
    },

    #[error("network: {0}")]
    Network(#[from] reqwest::Error),

    #[error("decode {path}: {message}")]
    Decode { path: String, message: String },

    #[error("server lists no node")]
    NoNode,
}

impl PveError {
    /// Whether the API answered "no such object".
    pub fn is_not_found(&self) -> bool {
        match self {
            PveError::Api { status, message, .. } => {
                *status == 404 || message.contains("does not exist")
            }
            _ => false,
        }
    }
}

/// One Proxmox server. Each server in the inventory runs a single node.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Logical inventory name.
    fn host(&self) -> &str;

    /// Node name used in `/nodes/{node}/...` paths.
    fn node(&self) -> &str;

    async fn list_vms(&self) -> Result<Vec<VmEntry>, PveError>;

    async fn vm_status(&self, vmid: u32) -> Result<VmStatus, PveError>;

    async fn next_vmid(&self) -> Result<u32, PveError>;

    /// Clone `template` as described by `params`.
    async fn clone_vm(&self, template: u32, params: &CloneParams) -> Result<Upid, PveError>;

    async fn power(&self, vmid: u32, action: PowerAction) -> Result<Upid, PveError>;

    async fn delete_vm(&self, vmid: u32) -> Result<Upid, PveError>;

    async fn vm_config(&self, vmid: u32) -> Result<VmConfig, PveError>;

    /// Set config keys (`net0`, `net1`, ...). Applies to running VMs too.
    async fn update_vm_config(
        &self,
        vmid: u32,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), PveError>;

    async fn task_status(&self, upid: &Upid) -> Result<TaskStatus, PveError>;

    /// Succeeds once the guest agent answers.
    async fn ping_agent(&self, vmid: u32) -> Result<(), PveError>;

    async fn guest_interfaces(&self, vmid: u32) -> Result<Vec<GuestInterface>, PveError>;

    async fn list_pools(&self) -> Result<Vec<PoolEntry>, PveError>;

    async fn list_storages(&self) -> Result<Vec<StorageEntry>, PveError>;

    async fn list_network(&self) -> Result<Vec<NetworkIface>, PveError>;

    // -----------------------------------------------------------------------
    // Lookups built on the listings
    // -----------------------------------------------------------------------

    async fn find_vm(&self, vmid: u32) -> Result<Option<VmEntry>, PveError> {
        Ok(self.list_vms().await?.into_iter().find(|vm| vm.vmid == vmid))
    }

    /// A VM with this name that is marked as a template. Regular VMs with the
    /// same name are ignored.
    async fn find_template(&self, name: &str) -> Result<Option<VmEntry>, PveError> {
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .find(|vm| vm.template && vm.name.as_deref() == Some(name)))
    }

    async fn pool_exists(&self, pool: &str) -> Result<bool, PveError> {
        Ok(self.list_pools().await?.iter().any(|p| p.poolid == pool))
    }

    async fn storage_exists(&self, storage: &str) -> Result<bool, PveError> {
        Ok(self.list_storages().await?.iter().any(|s| s.storage == storage))
    }

    async fn bridge_exists(&self, bridge: &str) -> Result<bool, PveError> {
        Ok(self
            .list_network()
            .await?
            .iter()
            .any(|iface| iface.iface == bridge && iface.is_bridge()))
    }
}

/// Opens a connection to one inventory server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &ServerEntry) -> Result<Arc<dyn Hypervisor>, PveError>;
}

/// Connects over HTTPS with one set of credentials for every server.
pub struct PveConnector {
    credentials: Credentials,
    api: ApiConfig,
}

impl PveConnector {
    pub fn new(credentials: Credentials, api: ApiConfig) -> Self {
        Self { credentials, api }
    }
}

#[async_trait]
impl Connector for PveConnector {
    async fn connect(&self, server: &ServerEntry) -> Result<Arc<dyn Hypervisor>, PveError> {
        let client = PveClient::connect(server, &self.credentials, &self.api).await?;
        Ok(Arc::new(client))
    }
}
