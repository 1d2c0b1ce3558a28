//! Management address discovery through the QEMU guest agent.
//!
//! Rows are handled one after the other: each guest agent is a single
//! serial channel and a fleet of them answering at once swamps the host.

use std::net::Ipv4Addr;
use std::time::Duration;

use proxfleet_protocol::GuestInterface;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ConnectionCache, RowOutcome};
use crate::config::{AgentConfig, Config};
use crate::jobfile::{line_of, JobRow, VmId, STATUS_RUNNING};
use crate::net::Subnet;
use crate::pve::Hypervisor;

/// First address that falls in the highest-priority subnet with any match.
///
/// Subnet order wins over interface order: an address in the second subnet
/// is only returned when no interface has one in the first.
pub fn pick_management_ip(interfaces: &[GuestInterface], subnets: &[Subnet]) -> Option<Ipv4Addr> {
    subnets.iter().find_map(|subnet| {
        interfaces
            .iter()
            .flat_map(GuestInterface::ipv4_addrs)
            .find(|addr| subnet.contains(*addr))
    })
}

pub async fn resolve_rows(
    rows: &mut [JobRow],
    cache: &mut ConnectionCache,
    config: &Config,
) -> Vec<RowOutcome> {
    cache
        .warm(
            rows.iter()
                .filter(|r| r.status == STATUS_RUNNING && !r.newid.is_empty())
                .map(|r| r.target_host.as_str()),
        )
        .await;

    let mut outcomes = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter_mut().enumerate() {
        let outcome = resolve_row(index, row, cache, config).await;
        if let RowOutcome::Failed(reason) = &outcome {
            warn!(line = line_of(index), reason = %reason, "no management address");
            row.ipv4.clear();
        }
        outcomes.push(outcome);
    }
    outcomes
}

async fn resolve_row(
    index: usize,
    row: &mut JobRow,
    cache: &mut ConnectionCache,
    config: &Config,
) -> RowOutcome {
    let line = line_of(index);
    if row.status != STATUS_RUNNING {
        return RowOutcome::skipped(format!("status is '{}'", row.status));
    }
    let vmid = match row.vmid() {
        VmId::Missing => return RowOutcome::skipped("not provisioned"),
        VmId::Invalid => return RowOutcome::failed(format!("invalid newid '{}'", row.newid)),
        VmId::Valid(id) => id,
    };
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
    let enabled = match hv.vm_config(vmid).await {
        Ok(vm) => vm.agent_enabled(),
        Err(e) => return RowOutcome::failed(format!("VM {vmid} config unavailable: {e}")),
    };
    if !enabled {
        row.ipv4.clear();
        return RowOutcome::skipped("guest agent disabled");
    }

    match discover(hv, vmid, &config.agent, &config.network.management_subnets).await {
        Ok(addr) => {
            info!(line, host = hv.host(), vmid, ipv4 = %addr, "management address found");
            row.ipv4 = addr.to_string();
            RowOutcome::Succeeded
        }
        Err(reason) => RowOutcome::Failed(reason),
    }
}

/// Wait for the agent to answer, then query interfaces until one carries an
/// address in `subnets`. Both phases share one deadline.
async fn discover(
    hv: &dyn Hypervisor,
    vmid: u32,
    agent: &AgentConfig,
    subnets: &[Subnet],
) -> Result<Ipv4Addr, String> {
    let started = Instant::now();
    let timeout = Duration::from_secs(agent.timeout_secs);
    let remaining = || timeout.saturating_sub(started.elapsed());

    let mut pings = 0u32;
    loop {
        pings += 1;
        match hv.ping_agent(vmid).await {
            Ok(()) => break,
            Err(e) => debug!(vmid, pings, error = %e, "guest agent not ready"),
        }
        if remaining().is_zero() {
            return Err(format!(
                "guest agent did not answer within {}s ({pings} pings)",
                timeout.as_secs()
            ));
        }
        if pings % 10 == 0 {
            info!(vmid, pings, elapsed_s = started.elapsed().as_secs(), "waiting for guest agent");
        }
        tokio::time::sleep(Duration::from_secs(agent.ping_interval_secs).min(remaining())).await;
    }
    debug!(vmid, pings, elapsed_s = started.elapsed().as_secs(), "guest agent answered");

    let interval = Duration::from_secs(agent.ip_interval_secs);
    for attempt in 1..=agent.ip_attempts {
        match hv.guest_interfaces(vmid).await {
            Ok(interfaces) => {
                if let Some(addr) = pick_management_ip(&interfaces, subnets) {
                    return Ok(addr);
                }
                debug!(vmid, attempt, interfaces = interfaces.len(), "no management address yet");
            }
            Err(e) => debug!(vmid, attempt, error = %e, "interface query failed"),
        }
        if attempt == agent.ip_attempts || remaining().is_zero() {
            break;
        }
        tokio::time::sleep(interval.min(remaining())).await;
    }
    Err(format!(
        "no address in a management subnet after {}s",
        started.elapsed().as_secs()
    ))
}
