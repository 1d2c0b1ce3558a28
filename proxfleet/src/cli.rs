//! Human-readable and JSON rendering of action results.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::fleet::deploy::DeployReport;
use crate::fleet::{ActionReport, RowOutcome, ValidationReport};

const PASS: &str = "\u{2713}";
const FAIL: &str = "\u{2717}";

/// Validation plus clone, network, start and address resolution.
const DEPLOY_STEPS: usize = 5;

/// Load a config from an optional path, falling back to defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serializing report")?;
    println!("{out}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

pub fn render_report(report: &ActionReport) -> String {
    let mut out = String::new();
    for row in &report.rows {
        let (icon, detail) = match &row.outcome {
            RowOutcome::Succeeded => (PASS, String::new()),
            RowOutcome::Skipped(reason) => (PASS, format!(" (skipped: {reason})")),
            RowOutcome::Failed(reason) => (FAIL, format!(" ({reason})")),
        };
        let _ = writeln!(out, "  {icon} line {:<4} {}{detail}", row.line, row.label);
    }
    let _ = writeln!(
        out,
        "\n{}: {}/{} ok ({} done, {} skipped, {} failed)",
        report.action,
        report.rows.len() - report.failed(),
        report.rows.len(),
        report.succeeded(),
        report.skipped(),
        report.failed(),
    );
    let failed: Vec<String> = report.failures().map(|r| r.line.to_string()).collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "{FAIL} failed lines: {}", failed.join(", "));
    }
    out
}

pub fn render_validation(validation: &ValidationReport) -> String {
    let mut out = String::new();
    if validation.is_valid() {
        let _ = writeln!(out, "{PASS} job file valid ({} rows)", validation.report.rows.len());
        return out;
    }
    for line in &validation.errors {
        let tags: Vec<&str> = line.errors.iter().map(|e| e.as_str()).collect();
        let _ = writeln!(out, "  {FAIL} line {:<4} {}", line.line, tags.join(", "));
    }
    let _ = writeln!(
        out,
        "\n{FAIL} job file invalid: {} of {} rows have errors",
        validation.errors.len(),
        validation.report.rows.len()
    );
    out
}

pub fn render_deploy(deploy: &DeployReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "step 1/{DEPLOY_STEPS}: validate");
    out.push_str(&render_validation(&deploy.validation));
    if !deploy.validation.is_valid() {
        out.push_str("\ndeployment stopped before any VM was created\n");
        return out;
    }
    for (i, step) in deploy.steps.iter().enumerate() {
        let _ = writeln!(out, "\nstep {}/{DEPLOY_STEPS}: {}", i + 2, step.action);
        out.push_str(&render_report(step));
    }
    if deploy.all_ok() {
        let _ = writeln!(out, "\n{PASS} deployment complete");
    } else {
        let _ = writeln!(out, "\n{FAIL} deployment finished with failures");
    }
    out
}
