//! Bridge attachment of `net0`/`net1`, applied to running or stopped VMs alike.

use std::collections::BTreeMap;

use proxfleet_protocol::VmConfig;
use tracing::{debug, info, warn};

use super::{ConnectionCache, RowOutcome};
use crate::config::Config;
use crate::jobfile::{line_of, JobRow, VmId};
use crate::net::{new_nic, nic_bridge, nic_model, with_bridge};
use crate::pve::Hypervisor;

/// Change needed to put one NIC slot on its desired bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPlan {
    /// Already attached to the bridge.
    Unchanged,
    /// Slot does not exist yet.
    Create(String),
    /// Slot exists; only its `bridge=` component changes.
    Rewrite(String),
}

/// Plan slot `slot` of `config` for `bridge`.
///
/// A new NIC copies the model of the first other NIC that shows one and
/// falls back to `default_model`.
pub fn plan_slot(config: &VmConfig, slot: u8, bridge: &str, default_model: &str) -> SlotPlan {
    let nics = config.nics();
    match nics.get(&slot) {
        Some(current) if nic_bridge(current) == Some(bridge) => SlotPlan::Unchanged,
        Some(current) => SlotPlan::Rewrite(with_bridge(current, bridge)),
        None => {
            let model = nics
                .iter()
                .filter(|(other, _)| **other != slot)
                .find_map(|(_, spec)| nic_model(spec))
                .unwrap_or(default_model);
            SlotPlan::Create(new_nic(model, bridge))
        }
    }
}

pub async fn reconcile_rows(
    rows: &[JobRow],
    cache: &mut ConnectionCache,
    config: &Config,
) -> Vec<RowOutcome> {
    cache
        .warm(
            rows.iter()
                .filter(|r| !r.newid.is_empty() && r.wants_network())
                .map(|r| r.target_host.as_str()),
        )
        .await;

    let mut outcomes = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let outcome = reconcile_row(index, row, cache, config).await;
        if let RowOutcome::Failed(reason) = &outcome {
            warn!(line = line_of(index), reason = %reason, "network update failed");
        }
        outcomes.push(outcome);
    }
    outcomes
}

async fn reconcile_row(
    index: usize,
    row: &JobRow,
    cache: &mut ConnectionCache,
    config: &Config,
) -> RowOutcome {
    let line = line_of(index);
    let vmid = match row.vmid() {
        VmId::Missing => return RowOutcome::skipped("not provisioned"),
        VmId::Invalid => return RowOutcome::failed(format!("invalid newid '{}'", row.newid)),
        VmId::Valid(id) => id,
    };
    if !row.wants_network() {
        return RowOutcome::skipped("no bridges requested");
    }
    let hv = match cache.get(&row.target_host).await {
        Ok(hv) => hv,
        Err(e) => return RowOutcome::failed(e.to_string()),
    };
    let hv: &dyn Hypervisor = hv.as_ref();

    match hv.find_vm(vmid).await {
        Ok(Some(_)) => {}
        Ok(None) => return RowOutcome::failed(format!("VM {vmid} not found on {}", hv.host())),
        Err(e) => return RowOutcome::failed(format!("VM {vmid} lookup failed: {e}")),
    }
    let current = match hv.vm_config(vmid).await {
        Ok(current) => current,
        Err(e) => return RowOutcome::failed(format!("VM {vmid} config unavailable: {e}")),
    };

    let mut errors = Vec::new();
    let mut changed = 0;
    for (slot, bridge) in [(0u8, &row.net0), (1u8, &row.net1)] {
        if bridge.is_empty() {
            continue;
        }
        let key = format!("net{slot}");
        let value = match plan_slot(&current, slot, bridge, &config.network.default_nic_model) {
            SlotPlan::Unchanged => {
                debug!(line, vmid, nic = %key, bridge = %bridge, "already attached");
                continue;
            }
            SlotPlan::Create(value) | SlotPlan::Rewrite(value) => value,
        };
        let changes = BTreeMap::from([(key.clone(), value)]);
        match hv.update_vm_config(vmid, &changes).await {
            Ok(()) => {
                changed += 1;
                debug!(line, vmid, nic = %key, bridge = %bridge, "bridge set");
            }
            Err(e) => errors.push(format!("{key}: {e}")),
        }
    }

    if !errors.is_empty() {
        return RowOutcome::failed(errors.join("; "));
    }
    if changed == 0 {
        return RowOutcome::skipped("bridges already attached");
    }
    info!(line, host = hv.host(), vmid, changed, "network updated");
    RowOutcome::Succeeded
}
