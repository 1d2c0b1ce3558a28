mod cli;
mod config;
mod fleet;
mod inventory;
mod jobfile;
mod net;
mod pve;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::fleet::{ActionReport, Fleet};
use crate::inventory::Inventory;
use crate::pve::{Credentials, PveConnector};

#[derive(Parser)]
#[command(name = "proxfleet", about = "Bulk VM lifecycle orchestration for Proxmox VE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// CSV job file, one row per VM. Rewritten in place after each action.
    #[arg(long, short, global = true, default_value = "vms.csv")]
    file: PathBuf,

    /// YAML server inventory mapping host names to API addresses.
    #[arg(long, global = true, default_value = "config.yaml")]
    inventory: PathBuf,

    /// Path to config file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity. RUST_LOG takes precedence when set.
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Print the report as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    auth: AuthArgs,
}

#[derive(clap::Args)]
struct AuthArgs {
    /// Proxmox user, e.g. root@pam.
    #[arg(long, env = "PROXMOX_USER", global = true)]
    user: Option<String>,

    #[arg(long, env = "PROXMOX_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// Authenticate with an API token instead of a password.
    #[arg(long, env = "PROXMOX_USE_TOKEN", global = true)]
    use_token: bool,

    #[arg(long, env = "PROXMOX_TOKEN_NAME", global = true)]
    token_name: Option<String>,

    #[arg(long, env = "PROXMOX_TOKEN_VALUE", global = true, hide_env_values = true)]
    token_value: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    /// Warnings and errors only.
    #[value(name = "none")]
    Quiet,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Quiet => "warn",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check every row against the inventory and the live hosts. Changes nothing.
    Validate,
    /// Full-clone templates for rows with an empty status.
    Clone,
    /// Start provisioned VMs.
    Start,
    /// Stop provisioned VMs.
    Stop {
        /// ACPI shutdown instead of a hard stop.
        #[arg(long)]
        graceful: bool,
    },
    /// Reboot running VMs.
    Reboot,
    /// Delete provisioned VMs and clear their rows.
    Delete,
    /// Attach net0/net1 to the bridges named in the job file.
    Network,
    /// Read management addresses of running VMs from the guest agent.
    Ip,
    /// Validate, clone, attach bridges, start, then read addresses.
    Deploy,
}

fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the selected action; `Ok(false)` when any row failed.
async fn run(cli: Cli) -> Result<bool> {
    let config = cli::load_config(cli.config)?;
    let inventory = Inventory::load(&cli.inventory)?;
    let credentials = Credentials::resolve(
        cli.auth.user,
        cli.auth.password,
        cli.auth.use_token,
        cli.auth.token_name,
        cli.auth.token_value,
    )
    .context("resolving Proxmox credentials")?;
    info!(
        user = credentials.user(),
        servers = inventory.servers.len(),
        file = %cli.file.display(),
        "starting"
    );

    let connector = Arc::new(PveConnector::new(credentials, config.api.clone()));
    let fleet = Fleet::new(config, inventory, connector);
    let path = cli.file.as_path();
    let json = cli.json;

    let ok = match cli.command {
        Commands::Validate => {
            let report = fleet.validate(path).await?;
            emit(json, &report, cli::render_validation)?;
            report.is_valid()
        }
        Commands::Deploy => {
            let report = fleet.deploy(path).await?;
            emit(json, &report, cli::render_deploy)?;
            report.all_ok()
        }
        Commands::Clone => finish(json, fleet.clone_vms(path).await?)?,
        Commands::Start => finish(json, fleet.start_vms(path).await?)?,
        Commands::Stop { graceful } => finish(json, fleet.stop_vms(path, graceful).await?)?,
        Commands::Reboot => finish(json, fleet.reboot_vms(path).await?)?,
        Commands::Delete => finish(json, fleet.delete_vms(path).await?)?,
        Commands::Network => finish(json, fleet.apply_networks(path).await?)?,
        Commands::Ip => finish(json, fleet.resolve_addresses(path).await?)?,
    };
    Ok(ok)
}

fn emit<T: Serialize>(json: bool, report: &T, render: fn(&T) -> String) -> Result<()> {
    if json {
        cli::print_json(report)
    } else {
        print!("{}", render(report));
        Ok(())
    }
}

fn finish(json: bool, report: ActionReport) -> Result<bool> {
    emit(json, &report, cli::render_report)?;
    Ok(report.all_ok())
}
