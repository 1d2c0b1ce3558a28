use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use super::{Action, ActionReport, ConnectError, ConnectionCache, RowOutcome};
use crate::jobfile::{line_of, JobRow, VmId};
use crate::pve::Hypervisor;

/// Field-level problem found in one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldError {
    StudentIdentity,
    TargetHost,
    ConnectionFailed,
    TemplateName,
    Pool,
    Storage,
    NewidInvalid,
    NewidConflict,
    Net0,
    Net1,
}

impl FieldError {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldError::StudentIdentity => "student_identity",
            FieldError::TargetHost => "target_host",
            FieldError::ConnectionFailed => "connection_failed",
            FieldError::TemplateName => "template_name",
            FieldError::Pool => "pool",
            FieldError::Storage => "storage",
            FieldError::NewidInvalid => "newid_invalid",
            FieldError::NewidConflict => "newid_conflict",
            FieldError::Net0 => "net0",
            FieldError::Net1 => "net1",
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineErrors {
    pub line: usize,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub report: ActionReport,
    pub errors: Vec<LineErrors>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check every row against the inventory and the live state of its host.
///
/// Checks do not stop at the first problem, except that an unknown host or
/// a failed connection ends the row since everything after needs the server.
/// Lookup errors count as "not found". The job file is not modified.
pub async fn validate_rows(rows: &[JobRow], cache: &mut ConnectionCache) -> ValidationReport {
    let known: Vec<&str> = rows
        .iter()
        .map(|r| r.target_host.as_str())
        .filter(|h| cache.knows(h))
        .collect();
    cache.warm(known).await;

    let mut outcomes = Vec::with_capacity(rows.len());
    let mut errors = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        let found = check_row(row, cache).await;
        if found.is_empty() {
            outcomes.push(RowOutcome::Succeeded);
        } else {
            let tags: Vec<&str> = found.iter().map(FieldError::as_str).collect();
            info!(line = line_of(index), errors = %tags.join(","), "invalid row");
            outcomes.push(RowOutcome::failed(format!("invalid fields: {}", tags.join(", "))));
            errors.push(LineErrors { line: line_of(index), errors: found });
        }
    }

    ValidationReport {
        report: ActionReport::new(Action::Validate, rows, outcomes),
        errors,
    }
}

async fn check_row(row: &JobRow, cache: &mut ConnectionCache) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if !row.has_identity() {
        errors.push(FieldError::StudentIdentity);
    }

    let hv = match cache.get(&row.target_host).await {
        Ok(hv) => hv,
        Err(ConnectError::UnknownHost(_)) => {
            errors.push(FieldError::TargetHost);
            return errors;
        }
        Err(ConnectError::Failed { .. }) => {
            errors.push(FieldError::ConnectionFailed);
            return errors;
        }
    };
    let hv: &dyn Hypervisor = hv.as_ref();

    if row.template_name.is_empty()
        || !matches!(hv.find_template(&row.template_name).await, Ok(Some(_)))
    {
        errors.push(FieldError::TemplateName);
    }
    if row.pool.is_empty() || !hv.pool_exists(&row.pool).await.unwrap_or(false) {
        errors.push(FieldError::Pool);
    }
    if row.storage.is_empty() || !hv.storage_exists(&row.storage).await.unwrap_or(false) {
        errors.push(FieldError::Storage);
    }
    match row.vmid() {
        VmId::Missing => {}
        VmId::Invalid => errors.push(FieldError::NewidInvalid),
        VmId::Valid(id) => {
            if matches!(hv.find_vm(id).await, Ok(Some(_))) {
                errors.push(FieldError::NewidConflict);
            }
        }
    }
    for (bridge, tag) in [(&row.net0, FieldError::Net0), (&row.net1, FieldError::Net1)] {
        if !bridge.is_empty() && !hv.bridge_exists(bridge).await.unwrap_or(false) {
            errors.push(tag);
        }
    }

    debug!(host = hv.host(), label = %row.label(), errors = errors.len(), "row checked");
    errors
}
