use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Path prefix of the JSON flavour of the Proxmox VE API.
pub const API_PREFIX: &str = "/api2/json";

/// Default port of the Proxmox VE API daemon.
pub const DEFAULT_API_PORT: u16 = 8006;

/// Every response body is wrapped as `{"data": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Response of `POST /access/ticket`.
#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: String,
    #[serde(default)]
    pub username: Option<String>,
}

// ---------------------------------------------------------------------------
// Cluster resources
// ---------------------------------------------------------------------------

/// Entry of `GET /nodes`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Entry of `GET /nodes/{node}/qemu`.
#[derive(Debug, Clone, Deserialize)]
pub struct VmEntry {
    #[serde(deserialize_with = "de_u32_lenient")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    /// Power state as reported by the node (`running`, `stopped`, ...).
    #[serde(default)]
    pub status: Option<String>,
    /// Templates carry `template: 1`; regular VMs omit the field.
    #[serde(default, deserialize_with = "de_flag")]
    pub template: bool,
}

impl VmEntry {
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }

    pub fn is_stopped(&self) -> bool {
        self.status.as_deref() == Some("stopped")
    }
}

/// Response of `GET /nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Debug, Clone, Deserialize)]
pub struct VmStatus {
    pub status: String,
    #[serde(default)]
    pub qmpstatus: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl VmStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Entry of `GET /pools`.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolEntry {
    pub poolid: String,
}

/// Entry of `GET /nodes/{node}/storage`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageEntry {
    pub storage: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Entry of `GET /nodes/{node}/network`.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkIface {
    pub iface: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl NetworkIface {
    pub fn is_bridge(&self) -> bool {
        matches!(self.kind.as_deref(), Some("bridge") | Some("OVSBridge"))
    }
}

// ---------------------------------------------------------------------------
// VM operations
// ---------------------------------------------------------------------------

/// Form body of `POST /nodes/{node}/qemu/{template}/clone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloneParams {
    pub newid: u32,
    pub name: String,
    /// 1 requests a full (independent) copy instead of a linked clone.
    pub full: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl CloneParams {
    /// Full clone into `newid`, empty pool/storage values are omitted.
    pub fn full(newid: u32, name: impl Into<String>, pool: &str, storage: &str) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            newid,
            name: name.into(),
            full: 1,
            pool: non_empty(pool),
            storage: non_empty(storage),
        }
    }
}

/// Power transitions exposed under `/nodes/{node}/qemu/{vmid}/status/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    /// Hard power-off.
    Stop,
    /// ACPI shutdown request to the guest.
    Shutdown,
    /// ACPI reboot request to the guest.
    Reboot,
}

impl PowerAction {
    pub fn path_segment(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Reboot => "reboot",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Flat key/value view of `GET /nodes/{node}/qemu/{vmid}/config`.
///
/// Values are kept as raw JSON since Proxmox mixes numbers and strings
/// (`cores: 2`, `net0: "virtio=..,bridge=vmbr0"`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct VmConfig(pub BTreeMap<String, serde_json::Value>);

impl VmConfig {
    /// String form of a config value; numbers are rendered as-is.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Network device slots (`net0`, `net1`, ...) with their property strings.
    pub fn nics(&self) -> BTreeMap<u8, String> {
        self.0
            .keys()
            .filter_map(|key| {
                let slot = key.strip_prefix("net")?.parse::<u8>().ok()?;
                Some((slot, self.get(key)?))
            })
            .collect()
    }

    /// Whether the QEMU guest agent is enabled.
    ///
    /// The `agent` property is either a bare boolean (`1`) or a property
    /// string whose `enabled` key may be implicit (`1,fstrim_cloned_disks=1`).
    pub fn agent_enabled(&self) -> bool {
        let Some(agent) = self.get("agent") else {
            return false;
        };
        for part in agent.split(',') {
            let value = match part.split_once('=') {
                Some(("enabled", v)) => v,
                Some(_) => continue,
                None => part,
            };
            return matches!(value.trim(), "1" | "true" | "on" | "yes");
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Error parsing a task identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid UPID: {0:?}")]
pub struct UpidError(pub String);

/// Unique process identifier of a long-running task, e.g.
/// `UPID:pve1:000A1B2C:0123ABCD:65F0A1B2:qmclone:9000:root@pam:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Upid(String);

impl Upid {
    /// Node the task runs on.
    pub fn node(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    /// Task type (`qmclone`, `qmstart`, `qmdestroy`, ...).
    pub fn kind(&self) -> &str {
        self.0.split(':').nth(5).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Upid {
    type Err = UpidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() < 8 || fields[0] != "UPID" || fields[1].is_empty() {
            return Err(UpidError(s.to_string()));
        }
        Ok(Upid(s.to_string()))
    }
}

impl TryFrom<String> for Upid {
    type Error = UpidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Upid> for String {
    fn from(upid: Upid) -> Self {
        upid.0
    }
}

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response of `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    /// `running` while in progress, `stopped` once terminal.
    pub status: String,
    /// `OK` on success, an error message otherwise. Absent while running.
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.status == "stopped"
    }

    pub fn is_ok(&self) -> bool {
        self.is_finished() && self.exitstatus.as_deref() == Some("OK")
    }
}

// ---------------------------------------------------------------------------
// Guest agent
// ---------------------------------------------------------------------------

/// Guest agent commands wrap their payload as `{"result": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentResult<T> {
    pub result: T,
}

/// One interface of `agent/network-get-interfaces`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuestInterface {
    pub name: String,
    #[serde(rename = "hardware-address", default)]
    pub hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuestIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type")]
    pub kind: String,
    #[serde(default)]
    pub prefix: Option<u8>,
}

impl GuestInterface {
    /// IPv4 addresses reported for this interface, unparsable entries skipped.
    pub fn ipv4_addrs(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ip_addresses
            .iter()
            .filter(|addr| addr.kind == "ipv4")
            .filter_map(|addr| addr.ip_address.parse().ok())
    }
}

// ---------------------------------------------------------------------------
// Lenient field decoding
// ---------------------------------------------------------------------------

/// Proxmox encodes some integers as strings (`/cluster/nextid` returns `"105"`).
pub fn de_u32_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Num(i64),
        Str(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => false,
        Some(Raw::Bool(b)) => b,
        Some(Raw::Num(n)) => n != 0,
        Some(Raw::Str(s)) => matches!(s.as_str(), "1" | "true"),
    })
}

/// `GET /cluster/nextid` payload.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(transparent)]
pub struct NextId(#[serde(deserialize_with = "de_u32_lenient")] pub u32);
