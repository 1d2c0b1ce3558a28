//! Bulk actions over a job file.
//!
//! Every action follows the same shape: load the job table once, connect to
//! the distinct hosts its eligible rows reference, process the rows, write
//! the table back once, and report one outcome per row in file order.

pub mod address;
pub mod clone;
pub mod connections;
pub mod deploy;
pub mod lifecycle;
pub mod network;
pub mod task;
pub mod validate;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::inventory::Inventory;
use crate::jobfile::{line_of, JobRow, JobTable};
use crate::pve::Connector;

pub use connections::{ConnectError, ConnectionCache};
pub use validate::ValidationReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Validate,
    Clone,
    Start,
    Stop,
    Reboot,
    Delete,
    Network,
    ManagementIp,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Validate => "validate",
            Action::Clone => "clone",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Reboot => "reboot",
            Action::Delete => "delete",
            Action::Network => "network",
            Action::ManagementIp => "management-ip",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Row results
// ---------------------------------------------------------------------------

/// What happened to one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RowOutcome {
    Succeeded,
    /// Already in the target state; counts as success.
    Skipped(String),
    Failed(String),
}

impl RowOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        RowOutcome::Skipped(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        RowOutcome::Failed(reason.into())
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, RowOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowResult {
    pub index: usize,
    pub line: usize,
    pub label: String,
    #[serde(flatten)]
    pub outcome: RowOutcome,
}

/// Outcomes indexed by row, filled in any order.
#[derive(Debug)]
pub struct ResultArena {
    slots: Vec<Option<RowOutcome>>,
}

impl ResultArena {
    pub fn new(len: usize) -> Self {
        Self { slots: vec![None; len] }
    }

    pub fn set(&mut self, index: usize, outcome: RowOutcome) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(outcome);
        }
    }

    /// Outcomes in row order; unfilled slots become `Failed(missing)`.
    pub fn into_outcomes(self, missing: &str) -> Vec<RowOutcome> {
        self.slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| RowOutcome::failed(missing)))
            .collect()
    }
}

/// Result of one action over the whole job file.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub action: Action,
    /// One flag per row, in file order: true for succeeded or skipped.
    pub results: Vec<bool>,
    pub rows: Vec<RowResult>,
}

impl ActionReport {
    pub fn new(action: Action, rows: &[JobRow], outcomes: Vec<RowOutcome>) -> Self {
        let rows: Vec<RowResult> = rows
            .iter()
            .zip(outcomes)
            .enumerate()
            .map(|(index, (row, outcome))| RowResult {
                index,
                line: line_of(index),
                label: row.label(),
                outcome,
            })
            .collect();
        let results = rows.iter().map(|r| r.outcome.is_ok()).collect();
        Self { action, results, rows }
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, RowOutcome::Succeeded))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RowOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RowOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&RowOutcome) -> bool) -> usize {
        self.rows.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RowResult> {
        self.rows.iter().filter(|r| !r.outcome.is_ok())
    }

    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|ok| *ok)
    }
}

// ---------------------------------------------------------------------------
// Fleet
// ---------------------------------------------------------------------------

/// Entry point for every action: configuration, inventory and a way to
/// reach each server.
pub struct Fleet {
    config: Config,
    inventory: Inventory,
    connector: Arc<dyn Connector>,
}

impl Fleet {
    pub fn new(config: Config, inventory: Inventory, connector: Arc<dyn Connector>) -> Self {
        Self { config, inventory, connector }
    }

    /// Fresh cache for one action.
    fn connections(&self) -> ConnectionCache {
        ConnectionCache::new(self.inventory.clone(), self.connector.clone())
    }

    pub async fn validate(&self, path: &Path) -> Result<ValidationReport> {
        let table = JobTable::load(path).await?;
        let mut cache = self.connections();
        let report = validate::validate_rows(&table.rows, &mut cache).await;
        info!(
            path = %path.display(),
            rows = table.rows.len(),
            invalid = report.errors.len(),
            "validation finished"
        );
        Ok(report)
    }

    pub async fn clone_vms(&self, path: &Path) -> Result<ActionReport> {
        let mut table = JobTable::load(path).await?;
        let mut cache = self.connections();
        let outcomes = clone::clone_rows(&mut table.rows, &mut cache, &self.config).await;
        self.finish(Action::Clone, table, outcomes).await
    }

    pub async fn start_vms(&self, path: &Path) -> Result<ActionReport> {
        let mut table = JobTable::load(path).await?;
        let mut cache = self.connections();
        let outcomes = lifecycle::start_rows(&mut table.rows, &mut cache, &self.config).await;
        self.finish(Action::Start, table, outcomes).await
    }

    /// Hard stop, or an ACPI shutdown when `graceful`.
    pub async fn stop_vms(&self, path: &Path, graceful: bool) -> Result<ActionReport> {
        let mut table = JobTable::load(path).await?;
        let mut cache = self.connections();
        let outcomes =
            lifecycle::stop_rows(&mut table.rows, &mut cache, &self.config, graceful).await;
        self.finish(Action::Stop, table, outcomes).await
    }

    pub async fn reboot_vms(&self, path: &Path) -> Result<ActionReport> {
        let mut table = JobTable::load(path).await?;
        let mut cache = self.connections();
        let outcomes = lifecycle::reboot_rows(&mut table.rows, &mut cache, &self.config).await;
        self.finish(Action::Reboot, table, outcomes).await
    }

    pub async fn delete_vms(&self, path: &Path) -> Result<ActionReport> {
        let mut table = JobTable::load(path).await?;
        let mut cache = self.connections();
        let outcomes = lifecycle::delete_rows(&mut table.rows, &mut cache, &self.config).await;
        self.finish(Action::Delete, table, outcomes).await
    }

    pub async fn apply_networks(&self, path: &Path) -> Result<ActionReport> {
        let table = JobTable::load(path).await?;
        let mut cache = self.connections();
        let outcomes = network::reconcile_rows(&table.rows, &mut cache, &self.config).await;
        self.finish(Action::Network, table, outcomes).await
    }

    pub async fn resolve_addresses(&self, path: &Path) -> Result<ActionReport> {
        let mut table = JobTable::load(path).await?;
        let mut cache = self.connections();
        let outcomes = address::resolve_rows(&mut table.rows, &mut cache, &self.config).await;
        self.finish(Action::ManagementIp, table, outcomes).await
    }

    async fn finish(
        &self,
        action: Action,
        table: JobTable,
        outcomes: Vec<RowOutcome>,
    ) -> Result<ActionReport> {
        table.save().await?;
        let report = ActionReport::new(action, &table.rows, outcomes);
        info!(
            action = %action,
            path = %table.path().display(),
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "action finished"
        );
        Ok(report)
    }
}
