//! Power transitions and deletion, one row at a time.

use std::sync::Arc;

use proxfleet_protocol::PowerAction;
use tracing::{debug, info, warn};

use super::task::{wait_for_task, WaitPolicy};
use super::{ConnectionCache, RowOutcome};
use crate::config::Config;
use crate::jobfile::{line_of, JobRow, VmId, STATUS_ERROR, STATUS_RUNNING, STATUS_STOPPED};
use crate::pve::Hypervisor;

pub async fn start_rows(
    rows: &mut [JobRow],
    cache: &mut ConnectionCache,
    config: &Config,
) -> Vec<RowOutcome> {
    power_rows(rows, cache, PowerAction::Start, WaitPolicy::start(&config.timeouts)).await
}

pub async fn stop_rows(
    rows: &mut [JobRow],
    cache: &mut ConnectionCache,
    config: &Config,
    graceful: bool,
) -> Vec<RowOutcome> {
    let action = if graceful { PowerAction::Shutdown } else { PowerAction::Stop };
    power_rows(rows, cache, action, WaitPolicy::stop(&config.timeouts)).await
}

pub async fn reboot_rows(
    rows: &mut [JobRow],
    cache: &mut ConnectionCache,
    config: &Config,
) -> Vec<RowOutcome> {
    power_rows(rows, cache, PowerAction::Reboot, WaitPolicy::start(&config.timeouts)).await
}

pub async fn delete_rows(
    rows: &mut [JobRow],
    cache: &mut ConnectionCache,
    config: &Config,
) -> Vec<RowOutcome> {
    warm(rows, cache).await;
    let policy = WaitPolicy::delete(&config.timeouts);
    let mut outcomes = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter_mut().enumerate() {
        let outcome = delete_row(index, row, cache, policy).await;
        if matches!(outcome, RowOutcome::Failed(_)) {
            row.status = STATUS_ERROR.to_string();
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// Connect to the hosts of provisioned rows.
async fn warm(rows: &[JobRow], cache: &mut ConnectionCache) {
    cache
        .warm(
            rows.iter()
                .filter(|r| !r.newid.is_empty())
                .map(|r| r.target_host.as_str()),
        )
        .await;
}

/// Row's VM id and connection, or the outcome that ends the row.
async fn resolve(
    row: &JobRow,
    cache: &mut ConnectionCache,
) -> Result<(u32, Arc<dyn Hypervisor>), RowOutcome> {
    let vmid = match row.vmid() {
        VmId::Missing => return Err(RowOutcome::skipped("not provisioned")),
        VmId::Invalid => return Err(RowOutcome::failed(format!("invalid newid '{}'", row.newid))),
        VmId::Valid(id) => id,
    };
    let hv = cache
        .get(&row.target_host)
        .await
        .map_err(|e| RowOutcome::failed(e.to_string()))?;
    Ok((vmid, hv))
}

// ---------------------------------------------------------------------------
// start / stop / reboot
// ---------------------------------------------------------------------------

/// Live state a power action leaves the VM in.
fn target_state(action: PowerAction) -> &'static str {
    match action {
        PowerAction::Start | PowerAction::Reboot => STATUS_RUNNING,
        PowerAction::Stop | PowerAction::Shutdown => STATUS_STOPPED,
    }
}

async fn power_rows(
    rows: &mut [JobRow],
    cache: &mut ConnectionCache,
    action: PowerAction,
    policy: WaitPolicy,
) -> Vec<RowOutcome> {
    warm(rows, cache).await;
    let mut outcomes = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter_mut().enumerate() {
        let (outcome, status) = power_row(index, row, cache, action, policy).await;
        if let RowOutcome::Failed(reason) = &outcome {
            warn!(line = line_of(index), action = %action, reason = %reason, "row failed");
        }
        if let Some(status) = status {
            row.status = status.to_string();
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// Outcome of one row plus the status to record, if it changes.
async fn power_row(
    index: usize,
    row: &JobRow,
    cache: &mut ConnectionCache,
    action: PowerAction,
    policy: WaitPolicy,
) -> (RowOutcome, Option<&'static str>) {
    let line = line_of(index);
    let failed = |reason: String| (RowOutcome::Failed(reason), Some(STATUS_ERROR));
    let (vmid, hv) = match resolve(row, cache).await {
        Ok(found) => found,
        Err(outcome @ RowOutcome::Failed(_)) => return (outcome, Some(STATUS_ERROR)),
        Err(outcome) => {
            debug!(line, outcome = ?outcome, "row not provisioned");
            return (outcome, None);
        }
    };

    match hv.find_vm(vmid).await {
        Ok(Some(_)) => {}
        Ok(None) => return failed(format!("VM {vmid} not found on {}", hv.host())),
        Err(e) => return failed(format!("VM {vmid} lookup failed: {e}")),
    }
    let live = match hv.vm_status(vmid).await {
        Ok(status) => status,
        Err(e) => return failed(format!("VM {vmid} status unavailable: {e}")),
    };

    let target = target_state(action);
    match action {
        PowerAction::Reboot if !live.is_running() => {
            let reason = format!("VM {vmid} is {}, not running", live.status);
            return (RowOutcome::Failed(reason), Some(STATUS_STOPPED));
        }
        PowerAction::Reboot => {}
        _ if live.status == target => {
            debug!(line, vmid, status = %live.status, "already in target state");
            return (RowOutcome::skipped(format!("already {target}")), Some(target));
        }
        _ => {}
    }

    let upid = match hv.power(vmid, action).await {
        Ok(upid) => upid,
        Err(e) => return failed(format!("{action} request rejected: {e}")),
    };
    debug!(line, host = hv.host(), vmid, upid = %upid, "{action} task launched");

    let outcome = wait_for_task(hv.as_ref(), &upid, policy).await;
    if outcome.is_completed() {
        info!(line, host = hv.host(), vmid, "{action} finished");
        (RowOutcome::Succeeded, Some(target))
    } else {
        failed(format!("{action} {outcome}"))
    }
}

// ---------------------------------------------------------------------------
// delete
// ---------------------------------------------------------------------------

fn clear_provisioning(row: &mut JobRow) {
    row.status.clear();
    row.ipv4.clear();
    row.newid.clear();
}

async fn delete_row(
    index: usize,
    row: &mut JobRow,
    cache: &mut ConnectionCache,
    policy: WaitPolicy,
) -> RowOutcome {
    let line = line_of(index);
    let (vmid, hv) = match resolve(row, cache).await {
        Ok(found) => found,
        Err(outcome) => return outcome,
    };

    match hv.find_vm(vmid).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(line, host = hv.host(), vmid, "VM already absent, clearing row");
            clear_provisioning(row);
            return RowOutcome::skipped("already absent");
        }
        Err(e) => return RowOutcome::failed(format!("VM {vmid} lookup failed: {e}")),
    }

    let upid = match hv.delete_vm(vmid).await {
        Ok(upid) => upid,
        Err(e) if e.is_not_found() => {
            warn!(line, host = hv.host(), vmid, "VM vanished before delete, clearing row");
            clear_provisioning(row);
            return RowOutcome::skipped("already absent");
        }
        Err(e) => return RowOutcome::failed(format!("delete request rejected: {e}")),
    };
    debug!(line, host = hv.host(), vmid, upid = %upid, "delete task launched");

    let outcome = wait_for_task(hv.as_ref(), &upid, policy).await;
    if outcome.is_completed() {
        info!(line, host = hv.host(), vmid, "VM deleted");
        clear_provisioning(row);
        RowOutcome::Succeeded
    } else {
        warn!(line, host = hv.host(), vmid, outcome = %outcome, "delete did not finish");
        RowOutcome::failed(format!("delete {outcome}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::{csv_line, write_jobs};
    use crate::fleet::Fleet;
    use crate::jobfile::JobTable;
    use crate::pve::fake::{FakeConnector, FakeHypervisor, TaskScript};

    fn row(login: &str, host: &str, newid: &str, status: &str) -> String {
        csv_line(["", "", login, host, login, "debian12-tpl", "students", "local-lvm", newid, "", "", "192.168.140.20", status])
    }

    fn fleet_for(hv: Arc<FakeHypervisor>) -> Fleet {
        let connector = Arc::new(FakeConnector::new().with_host(hv).refusing("lab2"));
        Fleet::new(Config::default(), connector.inventory(), connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_skips_running_and_unprovisioned() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jobs(
            &dir,
            &[
                row("a", "lab1", "101", "cloned"),
                row("b", "lab1", "102", "stopped"),
                row("c", "lab1", "", ""),
                row("d", "lab1", "104", "cloned"),
            ],
        );
        let hv = Arc::new(
            FakeHypervisor::new("lab1")
                .with_vm(101, "a", "stopped")
                .with_vm(102, "b", "running"),
        );
        let fleet = fleet_for(hv.clone());

        let report = fleet.start_vms(&path).await.unwrap();
        assert_eq!(report.results, vec![true, true, true, false]);
        assert_eq!((report.succeeded(), report.skipped(), report.failed()), (1, 2, 1));
        assert_eq!(hv.power_calls(), vec![(101, PowerAction::Start)]);

        let table = JobTable::load(&path).await.unwrap();
        let statuses: Vec<&str> = table.rows.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["running", "running", "", "error"]);
        assert!(hv.vm(101).unwrap().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_hard_and_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jobs(
            &dir,
            &[row("a", "lab1", "101", "running"), row("b", "lab1", "102", "running")],
        );
        let hv = Arc::new(
            FakeHypervisor::new("lab1")
                .with_vm(101, "a", "running")
                .with_vm(102, "b", "stopped"),
        );
        let fleet = fleet_for(hv.clone());

        let report = fleet.stop_vms(&path, true).await.unwrap();
        assert!(report.all_ok());
        assert_eq!(hv.power_calls(), vec![(101, PowerAction::Shutdown)]);
        let table = JobTable::load(&path).await.unwrap();
        assert_eq!(table.rows[0].status, STATUS_STOPPED);
        assert_eq!(table.rows[1].status, STATUS_STOPPED);

        let report = fleet.stop_vms(&path, false).await.unwrap();
        assert_eq!(report.skipped(), 2);
        assert_eq!(hv.power_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_marks_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jobs(&dir, &[row("a", "lab1", "101", "cloned")]);
        let hv = Arc::new(
            FakeHypervisor::new("lab1")
                .with_vm(101, "a", "stopped")
                .with_task_script(101, TaskScript::Hang),
        );
        let fleet = fleet_for(hv);

        let started = tokio::time::Instant::now();
        let report = fleet.start_vms(&path).await.unwrap();
        assert_eq!(started.elapsed(), std::time::Duration::from_secs(60));
        assert!(matches!(&report.rows[0].outcome, RowOutcome::Failed(r) if r.contains("timed out after 60s")));
        assert_eq!(JobTable::load(&path).await.unwrap().rows[0].status, STATUS_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_newid_and_unreachable_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jobs(
            &dir,
            &[row("a", "lab1", "x1", "cloned"), row("b", "lab2", "102", "cloned")],
        );
        let fleet = fleet_for(Arc::new(FakeHypervisor::new("lab1")));

        let report = fleet.start_vms(&path).await.unwrap();
        assert_eq!(report.results, vec![false, false]);
        assert!(matches!(&report.rows[0].outcome, RowOutcome::Failed(r) if r == "invalid newid 'x1'"));
        assert!(matches!(&report.rows[1].outcome, RowOutcome::Failed(r) if r.contains("lab2")));
        let table = JobTable::load(&path).await.unwrap();
        assert!(table.rows.iter().all(|r| r.status == STATUS_ERROR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_requires_running_vm() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jobs(
            &dir,
            &[row("a", "lab1", "101", "running"), row("b", "lab1", "102", "running")],
        );
        let hv = Arc::new(
            FakeHypervisor::new("lab1")
                .with_vm(101, "a", "running")
                .with_vm(102, "b", "stopped"),
        );
        let fleet = fleet_for(hv.clone());

        let report = fleet.reboot_vms(&path).await.unwrap();
        assert_eq!(report.results, vec![true, false]);
        assert_eq!(hv.power_calls(), vec![(101, PowerAction::Reboot)]);
        let table = JobTable::load(&path).await.unwrap();
        assert_eq!(table.rows[0].status, STATUS_RUNNING);
        assert_eq!(table.rows[1].status, STATUS_STOPPED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_is_idempotent_to_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jobs(
            &dir,
            &[
                row("gone", "lab1", "150", "running"),
                row("here", "lab1", "151", "stopped"),
                row("never", "lab1", "", ""),
            ],
        );
        let hv = Arc::new(FakeHypervisor::new("lab1").with_vm(151, "here", "stopped"));
        let fleet = fleet_for(hv.clone());

        let report = fleet.delete_vms(&path).await.unwrap();
        assert_eq!(report.results, vec![true, true, true]);
        assert_eq!((report.succeeded(), report.skipped()), (1, 2));
        assert!(hv.vm(151).is_none());

        let table = JobTable::load(&path).await.unwrap();
        for row in &table.rows[..2] {
            assert_eq!((row.status.as_str(), row.ipv4.as_str(), row.newid.as_str()), ("", "", ""));
        }
        // Unprovisioned rows are left alone.
        assert_eq!(table.rows[2].ipv4, "192.168.140.20");

        let again = fleet.delete_vms(&path).await.unwrap();
        assert_eq!(again.skipped(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_task_failure_keeps_newid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jobs(&dir, &[row("a", "lab1", "151", "stopped")]);
        let hv = Arc::new(
            FakeHypervisor::new("lab1")
                .with_vm(151, "a", "stopped")
                .with_task_script(151, TaskScript::Fail("VM is locked (clone)".into())),
        );
        let fleet = fleet_for(hv.clone());

        let report = fleet.delete_vms(&path).await.unwrap();
        assert!(!report.all_ok());
        let table = JobTable::load(&path).await.unwrap();
        assert_eq!(table.rows[0].status, STATUS_ERROR);
        assert_eq!(table.rows[0].newid, "151");
        assert!(hv.vm(151).is_some());
    }
}
