//! Full deployment: validate, clone, attach bridges, start, resolve addresses.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::{ActionReport, Fleet, ValidationReport};

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub validation: ValidationReport,
    /// Reports of the steps that ran, in order. Empty when validation failed.
    pub steps: Vec<ActionReport>,
}

impl DeployReport {
    pub fn all_ok(&self) -> bool {
        self.validation.is_valid() && self.steps.iter().all(ActionReport::all_ok)
    }
}

impl Fleet {
    /// Run every step over the job file. An invalid file stops the pipeline
    /// before anything is created; after that, row failures are reported and
    /// the remaining steps still run.
    pub async fn deploy(&self, path: &Path) -> Result<DeployReport> {
        let validation = self.validate(path).await?;
        if !validation.is_valid() {
            warn!(invalid = validation.errors.len(), "validation failed, deployment stopped");
            return Ok(DeployReport { validation, steps: Vec::new() });
        }

        let mut steps = Vec::with_capacity(4);
        steps.push(self.clone_vms(path).await?);
        steps.push(self.apply_networks(path).await?);
        steps.push(self.start_vms(path).await?);
        steps.push(self.resolve_addresses(path).await?);

        let report = DeployReport { validation, steps };
        info!(ok = report.all_ok(), "deployment finished");
        Ok(report)
    }
}
