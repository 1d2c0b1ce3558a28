//! reqwest client for the Proxmox VE JSON API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use proxfleet_protocol::{
    AgentResult, CloneParams, Envelope, GuestInterface, NetworkIface, NextId, NodeEntry,
    PoolEntry, PowerAction, StorageEntry, TaskStatus, Ticket, Upid, VmConfig, VmEntry, VmStatus,
};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{Credentials, Hypervisor, PveError};
use crate::config::ApiConfig;
use crate::inventory::ServerEntry;

enum Session {
    Ticket { cookie: String, csrf_token: String },
    Token { header: String },
}

/// Authenticated handle on one Proxmox server and its node.
pub struct PveClient {
    http: reqwest::Client,
    base_url: String,
    host: String,
    node: String,
    session: Session,
}

impl PveClient {
    /// Authenticate and resolve the node name. The first node listed is used.
    #[instrument(skip(server, credentials, api), fields(host = %server.host))]
    pub async fn connect(
        server: &ServerEntry,
        credentials: &Credentials,
        api: &ApiConfig,
    ) -> Result<Self, PveError> {
        let verify_tls = server.verify_tls.unwrap_or(api.verify_tls);
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .timeout(api.request_timeout())
            .build()?;
        let base_url = server.base_url(api.port);

        let session = match credentials {
            Credentials::Token { .. } => Session::Token {
                header: credentials.token_header().unwrap_or_default(),
            },
            Credentials::Password { user, password } => {
                let ticket = login(&http, &base_url, user, password).await?;
                Session::Ticket {
                    cookie: format!("PVEAuthCookie={}", ticket.ticket),
                    csrf_token: ticket.csrf_token,
                }
            }
        };

        let mut client = Self {
            http,
            base_url,
            host: server.host.clone(),
            node: String::new(),
            session,
        };
        let nodes: Vec<NodeEntry> = client.get("/nodes").await.map_err(|e| match e {
            PveError::Api { status: 401, message, .. } => PveError::Auth(message),
            other => other,
        })?;
        client.node = nodes.into_iter().next().ok_or(PveError::NoNode)?.node;

        debug!(host = %client.host, node = %client.node, "connected");
        Ok(client)
    }

    fn node_path(&self, rest: &str) -> String {
        format!("/nodes/{}{}", self.node, rest)
    }

    fn qemu_path(&self, vmid: u32, rest: &str) -> String {
        format!("/nodes/{}/qemu/{}{}", self.node, vmid, rest)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mutating = method != Method::GET;
        let builder = self.http.request(method, url);
        match &self.session {
            Session::Token { header } => builder.header("Authorization", header),
            Session::Ticket { cookie, csrf_token } => {
                let builder = builder.header("Cookie", cookie);
                if mutating {
                    builder.header("CSRFPreventionToken", csrf_token)
                } else {
                    builder
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, PveError> {
        send(self.request(Method::GET, path), path).await
    }

    async fn post<T: DeserializeOwned, F: Serialize + ?Sized>(
        &self,
        path: &str,
        form: &F,
    ) -> Result<T, PveError> {
        send(self.request(Method::POST, path).form(form), path).await
    }

    async fn put<T: DeserializeOwned, F: Serialize + ?Sized>(
        &self,
        path: &str,
        form: &F,
    ) -> Result<T, PveError> {
        send(self.request(Method::PUT, path).form(form), path).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, PveError> {
        send(self.request(Method::DELETE, path), path).await
    }
}

async fn login(
    http: &reqwest::Client,
    base_url: &str,
    user: &str,
    password: &str,
) -> Result<Ticket, PveError> {
    let path = "/access/ticket";
    let builder = http
        .post(format!("{base_url}{path}"))
        .form(&[("username", user), ("password", password)]);
    send(builder, path).await.map_err(|e| match e {
        PveError::Api { status, message, .. } if status == 401 || status == 403 => {
            PveError::Auth(message)
        }
        other => other,
    })
}

/// Send a request and unwrap the `{"data": ...}` envelope.
async fn send<T: DeserializeOwned>(builder: RequestBuilder, path: &str) -> Result<T, PveError> {
    let resp = builder.send().await?;
    let status = resp.status();
    let body = resp.bytes().await?;

    if !status.is_success() {
        return Err(PveError::Api {
            status: status.as_u16(),
            path: path.to_string(),
            message: error_message(&body, status),
        });
    }

    serde_json::from_slice::<Envelope<T>>(&body)
        .map(|env| env.data)
        .map_err(|e| PveError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
}

/// Proxmox reports errors as `{"message": ..}` or `{"errors": {param: reason}}`.
fn error_message(body: &[u8], status: reqwest::StatusCode) -> String {
    let fallback = || status.canonical_reason().unwrap_or("request failed").to_string();
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        let text = String::from_utf8_lossy(body).trim().to_string();
        return if text.is_empty() { fallback() } else { text };
    };
    if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
        return message.trim().to_string();
    }
    if let Some(errors) = value.get("errors").and_then(|e| e.as_object()) {
        return errors
            .iter()
            .map(|(param, reason)| format!("{param}: {}", reason.as_str().unwrap_or_default().trim()))
            .collect::<Vec<_>>()
            .join("; ");
    }
    fallback()
}

#[async_trait]
impl Hypervisor for PveClient {
    fn host(&self) -> &str {
        &self.host
    }

    fn node(&self) -> &str {
        &self.node
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn list_vms(&self) -> Result<Vec<VmEntry>, PveError> {
        self.get(&self.node_path("/qemu")).await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn vm_status(&self, vmid: u32) -> Result<VmStatus, PveError> {
        self.get(&self.qemu_path(vmid, "/status/current")).await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn next_vmid(&self) -> Result<u32, PveError> {
        let next: NextId = self.get("/cluster/nextid").await?;
        Ok(next.0)
    }

    #[instrument(skip(self, params), fields(host = %self.host, newid = params.newid))]
    async fn clone_vm(&self, template: u32, params: &CloneParams) -> Result<Upid, PveError> {
        self.post(&self.qemu_path(template, "/clone"), params).await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn power(&self, vmid: u32, action: PowerAction) -> Result<Upid, PveError> {
        let path = self.qemu_path(vmid, &format!("/status/{}", action.path_segment()));
        self.post(&path, &[] as &[(&str, &str)]).await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn delete_vm(&self, vmid: u32) -> Result<Upid, PveError> {
        self.delete(&self.qemu_path(vmid, "")).await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn vm_config(&self, vmid: u32) -> Result<VmConfig, PveError> {
        self.get(&self.qemu_path(vmid, "/config")).await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn update_vm_config(
        &self,
        vmid: u32,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), PveError> {
        let _: serde_json::Value = self.put(&self.qemu_path(vmid, "/config"), changes).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.host, upid = %upid))]
    async fn task_status(&self, upid: &Upid) -> Result<TaskStatus, PveError> {
        let path = format!("/nodes/{}/tasks/{}/status", upid.node(), upid);
        self.get(&path).await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn ping_agent(&self, vmid: u32) -> Result<(), PveError> {
        let path = self.qemu_path(vmid, "/agent/ping");
        let _: serde_json::Value = self.post(&path, &[] as &[(&str, &str)]).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn guest_interfaces(&self, vmid: u32) -> Result<Vec<GuestInterface>, PveError> {
        let path = self.qemu_path(vmid, "/agent/network-get-interfaces");
        let result: AgentResult<Vec<GuestInterface>> = self.get(&path).await?;
        Ok(result.result)
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn list_pools(&self) -> Result<Vec<PoolEntry>, PveError> {
        self.get("/pools").await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn list_storages(&self) -> Result<Vec<StorageEntry>, PveError> {
        self.get(&self.node_path("/storage")).await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn list_network(&self) -> Result<Vec<NetworkIface>, PveError> {
        self.get(&self.node_path("/network")).await
    }
}
