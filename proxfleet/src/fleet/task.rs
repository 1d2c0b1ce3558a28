use std::fmt;
use std::time::Duration;

use proxfleet_protocol::Upid;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::TimeoutConfig;
use crate::pve::Hypervisor;

/// How often and for how long to poll one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl WaitPolicy {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self { poll_interval, timeout }
    }

    pub fn clone_task(t: &TimeoutConfig) -> Self {
        Self::new(Duration::from_secs(t.clone_poll_secs), Duration::from_secs(t.clone_secs))
    }

    pub fn start(t: &TimeoutConfig) -> Self {
        Self::new(Duration::from_secs(t.task_poll_secs), Duration::from_secs(t.start_secs))
    }

    pub fn stop(t: &TimeoutConfig) -> Self {
        Self::new(Duration::from_secs(t.task_poll_secs), Duration::from_secs(t.stop_secs))
    }

    pub fn delete(t: &TimeoutConfig) -> Self {
        Self::new(Duration::from_secs(t.task_poll_secs), Duration::from_secs(t.delete_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// `stopped` with exit status `OK`.
    Completed,
    /// `stopped` with any other exit status.
    Failed(String),
    /// Still running when the budget ran out. The task is left running.
    TimedOut(Duration),
    /// The status query itself failed.
    Unreachable(String),
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Completed => f.write_str("completed"),
            TaskOutcome::Failed(exit) => write!(f, "task failed: {exit}"),
            TaskOutcome::TimedOut(after) => write!(f, "task timed out after {}s", after.as_secs()),
            TaskOutcome::Unreachable(e) => write!(f, "task status unavailable: {e}"),
        }
    }
}

/// Poll `upid` until it stops or `policy.timeout` elapses.
///
/// Only observes the task; the request that created it is never re-issued.
/// A task that is still running is reported `TimedOut` no earlier than the
/// timeout: the last sleep is shortened to land on the deadline, and one
/// final status query is made there.
pub async fn wait_for_task(hv: &dyn Hypervisor, upid: &Upid, policy: WaitPolicy) -> TaskOutcome {
    let started = Instant::now();
    let mut polls = 0u32;
    loop {
        polls += 1;
        match hv.task_status(upid).await {
            Err(e) => {
                debug!(host = hv.host(), upid = %upid, error = %e, "task status query failed");
                return TaskOutcome::Unreachable(e.to_string());
            }
            Ok(status) if status.is_finished() => {
                let elapsed = started.elapsed();
                return if status.is_ok() {
                    debug!(host = hv.host(), upid = %upid, polls, elapsed_ms = elapsed.as_millis() as u64, "task completed");
                    TaskOutcome::Completed
                } else {
                    let exit = status.exitstatus.unwrap_or_else(|| "unknown exit status".into());
                    debug!(host = hv.host(), upid = %upid, exit = %exit, "task failed");
                    TaskOutcome::Failed(exit)
                };
            }
            Ok(_) => {}
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            debug!(host = hv.host(), upid = %upid, polls, "task still running at deadline");
            return TaskOutcome::TimedOut(policy.timeout);
        }
        trace!(host = hv.host(), upid = %upid, elapsed_s = elapsed.as_secs(), "task running");
        tokio::time::sleep(policy.poll_interval.min(policy.timeout - elapsed)).await;
    }
}
