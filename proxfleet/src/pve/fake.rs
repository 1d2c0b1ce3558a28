//! In-memory Proxmox server for orchestrator tests.
//!
//! Tasks complete on poll according to a per-VM [`TaskScript`]; their side
//! effect (VM created, powered on, removed, ...) is applied at the moment
//! the task reports success, like the real thing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use proxfleet_protocol::{
    CloneParams, GuestInterface, GuestIpAddress, NetworkIface, PoolEntry, PowerAction,
    StorageEntry, TaskStatus, Upid, VmConfig, VmEntry, VmStatus,
};
use serde_json::Value;

use super::{Connector, Hypervisor, PveError};
use crate::inventory::{Inventory, ServerEntry};

/// How a task created for a given VM behaves when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskScript {
    /// Report `running` for `after_polls` polls, then `stopped`/`OK`.
    Succeed { after_polls: u32 },
    /// Report `stopped` with this exit status on the first poll.
    Fail(String),
    /// Report `running` forever.
    Hang,
    /// Panic inside the status query, taking the caller's task down with it.
    Panic,
}

#[derive(Debug, Clone)]
enum Effect {
    Create { vmid: u32, name: String, config: BTreeMap<String, Value> },
    Power { vmid: u32, status: &'static str },
    Remove { vmid: u32 },
}

#[derive(Debug)]
struct FakeTask {
    script: TaskScript,
    polls: u32,
    effect: Option<Effect>,
}

#[derive(Debug, Clone)]
struct FakeVm {
    name: String,
    template: bool,
    status: String,
    config: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Clone)]
struct FakeAgent {
    ready_after_pings: u32,
    pings: u32,
    empty_queries: u32,
    interfaces: Vec<GuestInterface>,
}

#[derive(Default)]
struct FakeState {
    vms: BTreeMap<u32, FakeVm>,
    /// Ids whose clone was accepted but whose task has not finished yet.
    reserved: HashSet<u32>,
    pools: Vec<String>,
    storages: Vec<String>,
    bridges: Vec<String>,
    next_vmid: u32,
    task_seq: u32,
    tasks: HashMap<String, FakeTask>,
    scripts: HashMap<u32, TaskScript>,
    agents: HashMap<u32, FakeAgent>,
    failing_status_queries: HashSet<u32>,
    clones: Vec<(u32, CloneParams)>,
    power_calls: Vec<(u32, PowerAction)>,
    config_updates: Vec<(u32, BTreeMap<String, String>)>,
}

pub struct FakeHypervisor {
    host: String,
    node: String,
    state: Mutex<FakeState>,
    requests: AtomicUsize,
}

fn api_error(status: u16, path: String, message: impl Into<String>) -> PveError {
    PveError::Api { status, path, message: message.into() }
}

impl FakeHypervisor {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            node: format!("{host}-node"),
            state: Mutex::new(FakeState { next_vmid: 100, ..Default::default() }),
            requests: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn hit(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    pub fn with_template(self, vmid: u32, name: &str) -> Self {
        let mut config = BTreeMap::new();
        config.insert("net0".into(), Value::from("virtio=BC:24:11:00:00:01,bridge=vmbr0,firewall=1"));
        config.insert("agent".into(), Value::from("1"));
        self.state().vms.insert(
            vmid,
            FakeVm { name: name.into(), template: true, status: "stopped".into(), config },
        );
        self
    }

    pub fn with_vm(self, vmid: u32, name: &str, status: &str) -> Self {
        let mut config = BTreeMap::new();
        config.insert("net0".into(), Value::from("virtio=BC:24:11:00:01:05,bridge=vmbr0"));
        config.insert("agent".into(), Value::from("1"));
        self.state().vms.insert(
            vmid,
            FakeVm { name: name.into(), template: false, status: status.into(), config },
        );
        self
    }

    pub fn with_config(self, vmid: u32, key: &str, value: Value) -> Self {
        if let Some(vm) = self.state().vms.get_mut(&vmid) {
            if value.is_null() {
                vm.config.remove(key);
            } else {
                vm.config.insert(key.into(), value);
            }
        }
        self
    }

    pub fn with_pool(self, pool: &str) -> Self {
        self.state().pools.push(pool.into());
        self
    }

    pub fn with_storage(self, storage: &str) -> Self {
        self.state().storages.push(storage.into());
        self
    }

    pub fn with_bridge(self, bridge: &str) -> Self {
        self.state().bridges.push(bridge.into());
        self
    }

    /// Lowest id `/cluster/nextid` may hand out.
    pub fn with_next_vmid(self, vmid: u32) -> Self {
        self.state().next_vmid = vmid;
        self
    }

    /// Script for every task that targets `vmid` (for clones, the new id).
    pub fn with_task_script(self, vmid: u32, script: TaskScript) -> Self {
        self.state().scripts.insert(vmid, script);
        self
    }

    /// Guest agent for `vmid`: fails the first `ready_after_pings` pings, then
    /// returns no interfaces for `empty_queries` queries, then `ipv4` addresses.
    pub fn with_agent(
        self,
        vmid: u32,
        ready_after_pings: u32,
        empty_queries: u32,
        ipv4: &[(&str, &str)],
    ) -> Self {
        let interfaces = ipv4
            .iter()
            .map(|(iface, addr)| GuestInterface {
                name: iface.to_string(),
                hardware_address: None,
                ip_addresses: vec![GuestIpAddress {
                    ip_address: addr.to_string(),
                    kind: "ipv4".into(),
                    prefix: Some(24),
                }],
            })
            .collect();
        self.state().agents.insert(
            vmid,
            FakeAgent { ready_after_pings, pings: 0, empty_queries, interfaces },
        );
        self
    }

    /// Make task status queries for tasks on `vmid` fail at the transport level.
    pub fn with_broken_task_status(self, vmid: u32) -> Self {
        self.state().failing_status_queries.insert(vmid);
        self
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Number of API calls made so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn vm(&self, vmid: u32) -> Option<VmEntry> {
        self.state().vms.get(&vmid).map(|vm| entry(vmid, vm))
    }

    pub fn config_value(&self, vmid: u32, key: &str) -> Option<String> {
        let state = self.state();
        let vm = state.vms.get(&vmid)?;
        VmConfig(vm.config.clone()).get(key)
    }

    pub fn clones(&self) -> Vec<(u32, CloneParams)> {
        self.state().clones.clone()
    }

    pub fn power_calls(&self) -> Vec<(u32, PowerAction)> {
        self.state().power_calls.clone()
    }

    pub fn config_updates(&self) -> Vec<(u32, BTreeMap<String, String>)> {
        self.state().config_updates.clone()
    }

    fn start_task(&self, state: &mut FakeState, kind: &str, vmid: u32, effect: Effect) -> Upid {
        state.task_seq += 1;
        let raw = format!(
            "UPID:{}:{:08X}:00000000:65F0A1B2:{}:{}:root@pam:",
            self.node, state.task_seq, kind, vmid
        );
        let script = state
            .scripts
            .get(&vmid)
            .cloned()
            .unwrap_or(TaskScript::Succeed { after_polls: 0 });
        state.tasks.insert(raw.clone(), FakeTask { script, polls: 0, effect: Some(effect) });
        raw.parse().unwrap()
    }

    fn path(&self, rest: String) -> String {
        format!("/nodes/{}{}", self.node, rest)
    }
}

fn entry(vmid: u32, vm: &FakeVm) -> VmEntry {
    VmEntry {
        vmid,
        name: Some(vm.name.clone()),
        status: Some(vm.status.clone()),
        template: vm.template,
    }
}

fn apply(state: &mut FakeState, effect: Effect) {
    match effect {
        Effect::Create { vmid, name, config } => {
            state.reserved.remove(&vmid);
            state.vms.insert(
                vmid,
                FakeVm { name, template: false, status: "stopped".into(), config },
            );
        }
        Effect::Power { vmid, status } => {
            if let Some(vm) = state.vms.get_mut(&vmid) {
                vm.status = status.into();
            }
        }
        Effect::Remove { vmid } => {
            state.vms.remove(&vmid);
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn host(&self) -> &str {
        &self.host
    }

    fn node(&self) -> &str {
        &self.node
    }

    async fn list_vms(&self) -> Result<Vec<VmEntry>, PveError> {
        self.hit();
        Ok(self.state().vms.iter().map(|(id, vm)| entry(*id, vm)).collect())
    }

    async fn vm_status(&self, vmid: u32) -> Result<VmStatus, PveError> {
        self.hit();
        let state = self.state();
        let vm = state.vms.get(&vmid).ok_or_else(|| {
            api_error(500, self.path(format!("/qemu/{vmid}/status/current")), format!("VM {vmid} does not exist"))
        })?;
        Ok(VmStatus {
            status: vm.status.clone(),
            qmpstatus: Some(vm.status.clone()),
            name: Some(vm.name.clone()),
        })
    }

    async fn next_vmid(&self) -> Result<u32, PveError> {
        self.hit();
        // Same answer until a VM or a pending clone occupies the id.
        let state = self.state();
        let mut id = state.next_vmid;
        while state.vms.contains_key(&id) || state.reserved.contains(&id) {
            id += 1;
        }
        Ok(id)
    }

    async fn clone_vm(&self, template: u32, params: &CloneParams) -> Result<Upid, PveError> {
        self.hit();
        let path = self.path(format!("/qemu/{template}/clone"));
        let mut state = self.state();
        state.clones.push((template, params.clone()));
        let config = match state.vms.get(&template) {
            Some(vm) if vm.template => vm.config.clone(),
            Some(_) => return Err(api_error(500, path, format!("VM {template} is not a template"))),
            None => return Err(api_error(500, path, format!("VM {template} does not exist"))),
        };
        if state.vms.contains_key(&params.newid) || state.reserved.contains(&params.newid) {
            return Err(api_error(500, path, format!("VM {} already exists", params.newid)));
        }
        state.reserved.insert(params.newid);
        let effect = Effect::Create { vmid: params.newid, name: params.name.clone(), config };
        Ok(self.start_task(&mut state, "qmclone", params.newid, effect))
    }

    async fn power(&self, vmid: u32, action: PowerAction) -> Result<Upid, PveError> {
        self.hit();
        let path = self.path(format!("/qemu/{vmid}/status/{action}"));
        let mut state = self.state();
        state.power_calls.push((vmid, action));
        if !state.vms.contains_key(&vmid) {
            return Err(api_error(500, path, format!("VM {vmid} does not exist")));
        }
        let (kind, status) = match action {
            PowerAction::Start => ("qmstart", "running"),
            PowerAction::Stop => ("qmstop", "stopped"),
            PowerAction::Shutdown => ("qmshutdown", "stopped"),
            PowerAction::Reboot => ("qmreboot", "running"),
        };
        Ok(self.start_task(&mut state, kind, vmid, Effect::Power { vmid, status }))
    }

    async fn delete_vm(&self, vmid: u32) -> Result<Upid, PveError> {
        self.hit();
        let mut state = self.state();
        if !state.vms.contains_key(&vmid) {
            return Err(api_error(500, self.path(format!("/qemu/{vmid}")), format!("VM {vmid} does not exist")));
        }
        Ok(self.start_task(&mut state, "qmdestroy", vmid, Effect::Remove { vmid }))
    }

    async fn vm_config(&self, vmid: u32) -> Result<VmConfig, PveError> {
        self.hit();
        let state = self.state();
        let vm = state.vms.get(&vmid).ok_or_else(|| {
            api_error(500, self.path(format!("/qemu/{vmid}/config")), format!("VM {vmid} does not exist"))
        })?;
        Ok(VmConfig(vm.config.clone()))
    }

    async fn update_vm_config(
        &self,
        vmid: u32,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), PveError> {
        self.hit();
        let path = self.path(format!("/qemu/{vmid}/config"));
        let mut state = self.state();
        state.config_updates.push((vmid, changes.clone()));
        for (key, value) in changes {
            if let Some(bridge) = crate::net::nic_bridge(value) {
                if key.starts_with("net") && !state.bridges.iter().any(|b| b == bridge) {
                    return Err(api_error(400, path, format!("{key}: bridge '{bridge}' does not exist")));
                }
            }
        }
        let vm = state
            .vms
            .get_mut(&vmid)
            .ok_or_else(|| api_error(500, path.clone(), format!("VM {vmid} does not exist")))?;
        for (key, value) in changes {
            vm.config.insert(key.clone(), Value::from(value.clone()));
        }
        Ok(())
    }

    async fn task_status(&self, upid: &Upid) -> Result<TaskStatus, PveError> {
        self.hit();
        let mut state = self.state();
        let vmid: u32 = upid.as_str().split(':').nth(6).and_then(|v| v.parse().ok()).unwrap_or(0);
        if state.failing_status_queries.contains(&vmid) {
            return Err(api_error(595, format!("/nodes/{}/tasks", upid.node()), "no route to host"));
        }
        if state.tasks.get(upid.as_str()).is_some_and(|t| t.script == TaskScript::Panic) {
            // Release the lock first so sibling monitors keep working.
            drop(state);
            panic!("status query for VM {vmid} blew up");
        }
        let task = state.tasks.get_mut(upid.as_str()).ok_or_else(|| {
            api_error(500, format!("/nodes/{}/tasks", upid.node()), "no such task")
        })?;
        task.polls += 1;
        let mut released = None;
        let status = match &task.script {
            TaskScript::Hang | TaskScript::Panic => {
                TaskStatus { status: "running".into(), exitstatus: None }
            }
            TaskScript::Fail(reason) => {
                if let Some(Effect::Create { vmid, .. }) = task.effect.take() {
                    released = Some(vmid);
                }
                TaskStatus { status: "stopped".into(), exitstatus: Some(reason.clone()) }
            }
            TaskScript::Succeed { after_polls } if task.polls <= *after_polls => {
                TaskStatus { status: "running".into(), exitstatus: None }
            }
            TaskScript::Succeed { .. } => {
                TaskStatus { status: "stopped".into(), exitstatus: Some("OK".into()) }
            }
        };
        if status.is_ok() {
            if let Some(effect) = task.effect.take() {
                apply(&mut state, effect);
            }
        }
        if let Some(vmid) = released {
            state.reserved.remove(&vmid);
        }
        Ok(status)
    }

    async fn ping_agent(&self, vmid: u32) -> Result<(), PveError> {
        self.hit();
        let path = self.path(format!("/qemu/{vmid}/agent/ping"));
        let mut state = self.state();
        if state.vms.get(&vmid).map(|vm| vm.status.as_str()) != Some("running") {
            return Err(api_error(500, path, format!("VM {vmid} is not running")));
        }
        let agent = state.agents.entry(vmid).or_default();
        if agent.pings < agent.ready_after_pings {
            agent.pings += 1;
            return Err(api_error(500, path, "QEMU guest agent is not running"));
        }
        Ok(())
    }

    async fn guest_interfaces(&self, vmid: u32) -> Result<Vec<GuestInterface>, PveError> {
        self.hit();
        let mut state = self.state();
        let agent = state.agents.entry(vmid).or_default();
        if agent.empty_queries > 0 {
            agent.empty_queries -= 1;
            return Ok(Vec::new());
        }
        Ok(agent.interfaces.clone())
    }

    async fn list_pools(&self) -> Result<Vec<PoolEntry>, PveError> {
        self.hit();
        Ok(self.state().pools.iter().map(|p| PoolEntry { poolid: p.clone() }).collect())
    }

    async fn list_storages(&self) -> Result<Vec<StorageEntry>, PveError> {
        self.hit();
        Ok(self
            .state()
            .storages
            .iter()
            .map(|s| StorageEntry { storage: s.clone(), kind: Some("lvmthin".into()) })
            .collect())
    }

    async fn list_network(&self) -> Result<Vec<NetworkIface>, PveError> {
        self.hit();
        Ok(self
            .state()
            .bridges
            .iter()
            .map(|b| NetworkIface { iface: b.clone(), kind: Some("bridge".into()) })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeConnector {
    hosts: HashMap<String, Arc<FakeHypervisor>>,
    refused: HashSet<String>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, hypervisor: Arc<FakeHypervisor>) -> Self {
        self.hosts.insert(hypervisor.host().to_string(), hypervisor);
        self
    }

    /// Reject logins to `host` as if the credentials were wrong.
    pub fn refusing(mut self, host: &str) -> Self {
        self.refused.insert(host.to_string());
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Inventory listing every known and refused host.
    pub fn inventory(&self) -> Inventory {
        let mut hosts: Vec<&String> = self.hosts.keys().chain(self.refused.iter()).collect();
        hosts.sort();
        Inventory {
            servers: hosts
                .into_iter()
                .map(|h| ServerEntry {
                    host: h.clone(),
                    address: format!("{h}.lab.test"),
                    port: None,
                    verify_tls: None,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, server: &ServerEntry) -> Result<Arc<dyn Hypervisor>, PveError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refused.contains(&server.host) {
            return Err(PveError::Auth("authentication failure".into()));
        }
        match self.hosts.get(&server.host) {
            Some(hv) => Ok(hv.clone() as Arc<dyn Hypervisor>),
            None => Err(PveError::NoNode),
        }
    }
}
