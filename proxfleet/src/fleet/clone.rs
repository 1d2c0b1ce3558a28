//! Clone templates into new VMs.
//!
//! Clone requests are issued one row at a time; the resulting tasks are
//! then watched concurrently on a [`JoinSet`], at most
//! `clone.max_concurrent_monitors` at once. Rows are reconciled by index
//! once every monitor has returned, whatever the completion order.

use std::sync::Arc;

use proxfleet_protocol::{CloneParams, Upid};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::task::{wait_for_task, TaskOutcome, WaitPolicy};
use super::{ConnectionCache, ResultArena, RowOutcome};
use crate::config::Config;
use crate::jobfile::{line_of, JobRow, VmId, STATUS_CLONED, STATUS_ERROR};
use crate::pve::Hypervisor;

const MONITOR_ABORTED: &str = "monitor aborted";

/// A clone request the server accepted.
struct CloneTask {
    index: usize,
    hv: Arc<dyn Hypervisor>,
    upid: Upid,
    vmid: u32,
    name: String,
    generated_id: bool,
}

/// What the launch phase decided for one row.
enum Launch {
    Done(RowOutcome),
    Started(CloneTask),
}

pub async fn clone_rows(
    rows: &mut [JobRow],
    cache: &mut ConnectionCache,
    config: &Config,
) -> Vec<RowOutcome> {
    let total = rows.len();
    let mut arena = ResultArena::new(total);

    // Only rows that still need cloning cause a connection.
    cache
        .warm(
            rows.iter()
                .filter(|r| r.status.is_empty())
                .map(|r| r.target_host.as_str()),
        )
        .await;

    // ------------------------------------------------------------------
    // Launch, sequentially
    // ------------------------------------------------------------------
    let mut tasks = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        match launch(index, row, cache).await {
            Launch::Done(outcome) => arena.set(index, outcome),
            Launch::Started(task) => tasks.push(task),
        }
    }
    info!(launched = tasks.len(), rows = total, hosts = cache.connected(), "clone requests issued");

    // ------------------------------------------------------------------
    // Monitor, concurrently
    // ------------------------------------------------------------------
    let policy = WaitPolicy::clone_task(&config.timeouts);
    let permits = Arc::new(Semaphore::new(config.clone.max_concurrent_monitors));
    let mut monitors = JoinSet::new();
    let mut launched = Vec::with_capacity(tasks.len());
    for task in tasks {
        let hv = task.hv.clone();
        let upid = task.upid.clone();
        let index = task.index;
        let permits = permits.clone();
        monitors.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return (index, TaskOutcome::Unreachable("monitor pool closed".into()));
            };
            (index, wait_for_task(hv.as_ref(), &upid, policy).await)
        });
        launched.push(task);
    }

    let mut finished = vec![None; total];
    while let Some(joined) = monitors.join_next().await {
        match joined {
            Ok((index, outcome)) => finished[index] = Some(outcome),
            Err(e) => error!(error = %e, "clone monitor aborted"),
        }
    }

    // ------------------------------------------------------------------
    // Reconcile
    // ------------------------------------------------------------------
    for task in launched {
        let row = &mut rows[task.index];
        let line = line_of(task.index);
        match finished[task.index].take() {
            Some(TaskOutcome::Completed) => {
                info!(line, host = task.hv.host(), vmid = task.vmid, name = %task.name, "clone finished");
                row.status = STATUS_CLONED.to_string();
                if row.vm_name.is_empty() {
                    row.vm_name = task.name;
                }
                if task.generated_id {
                    row.newid = task.vmid.to_string();
                }
                arena.set(task.index, RowOutcome::Succeeded);
            }
            Some(outcome) => {
                warn!(line, host = task.hv.host(), vmid = task.vmid, outcome = %outcome, "clone did not finish");
                row.status = STATUS_ERROR.to_string();
                arena.set(task.index, RowOutcome::failed(format!("clone {outcome}")));
            }
            None => {
                row.status = STATUS_ERROR.to_string();
                arena.set(task.index, RowOutcome::failed(MONITOR_ABORTED));
            }
        }
    }

    let outcomes = arena.into_outcomes(MONITOR_ABORTED);
    for (row, outcome) in rows.iter_mut().zip(&outcomes) {
        if matches!(outcome, RowOutcome::Failed(_)) {
            row.status = STATUS_ERROR.to_string();
        }
    }
    outcomes
}

async fn launch(index: usize, row: &JobRow, cache: &mut ConnectionCache) -> Launch {
    let line = line_of(index);
    if !row.status.is_empty() {
        debug!(line, status = %row.status, "already processed, skipping");
        return Launch::Done(RowOutcome::skipped(format!("status is '{}'", row.status)));
    }
    let Some(name) = row.resolved_vm_name() else {
        warn!(line, "cannot derive a VM name");
        return Launch::Done(RowOutcome::failed("no VM name"));
    };
    let hv = match cache.get(&row.target_host).await {
        Ok(hv) => hv,
        Err(e) => return Launch::Done(RowOutcome::failed(e.to_string())),
    };

    let template = match hv.find_template(&row.template_name).await {
        Ok(Some(template)) => template.vmid,
        Ok(None) => {
            warn!(line, host = hv.host(), template = %row.template_name, "template not found");
            return Launch::Done(RowOutcome::failed(format!(
                "template '{}' not found on {}",
                row.template_name,
                hv.host()
            )));
        }
        Err(e) => {
            warn!(line, host = hv.host(), template = %row.template_name, error = %e, "template lookup failed");
            return Launch::Done(RowOutcome::failed(format!(
                "template '{}' not found on {}: {e}",
                row.template_name,
                hv.host()
            )));
        }
    };

    let (vmid, generated_id) = match row.vmid() {
        VmId::Valid(id) => (id, false),
        other => {
            if other == VmId::Invalid {
                warn!(line, newid = %row.newid, "invalid newid, allocating a free one");
            }
            match hv.next_vmid().await {
                Ok(id) => (id, true),
                Err(e) => {
                    warn!(line, host = hv.host(), error = %e, "no free VM id");
                    return Launch::Done(RowOutcome::failed(format!("unable to allocate a VM id: {e}")));
                }
            }
        }
    };

    let params = CloneParams::full(vmid, name.clone(), &row.pool, &row.storage);
    match hv.clone_vm(template, &params).await {
        Ok(upid) => {
            debug!(line, host = hv.host(), template, vmid, upid = %upid, "clone launched");
            Launch::Started(CloneTask { index, hv, upid, vmid, name, generated_id })
        }
        Err(e) => {
            warn!(line, host = hv.host(), vmid, error = %e, "clone request rejected");
            Launch::Done(RowOutcome::failed(format!("clone request rejected: {e}")))
        }
    }
}
