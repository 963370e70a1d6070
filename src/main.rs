//! vmleased: CLI for provisioning and retiring short-lived leased VMs.
//!
//! Runs unprivileged; everything that needs root (virsh, qemu-img, deleting
//! host files) goes through the `vmleased-rootd` agent over its Unix socket.
//!
//! Exit code is 0 on success and 1 on failure, except `status` and `list`
//! which always exit 0 so shell scripting around them stays simple.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::error;

use vmleased::agent::client::AgentClient;
use vmleased::config::Config;
use vmleased::logging;
use vmleased::vm::{CreateOpts, Orchestrator, gc};

#[derive(Parser, Debug)]
#[command(name = "vmleased", version, about = "Leased-VM lifecycle manager")]
struct Cli {
    /// Config file (default: $VMLEASED_CONFIG, then /etc/vmleased/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision and start a new VM
    Create {
        name: String,
        /// Human owner handle, recorded on the lease
        #[arg(long)]
        owner: String,
        /// Wallet address for the post-create credential mint
        #[arg(long)]
        wallet: Option<String>,
        /// Free-form note on what the VM is for
        #[arg(long, default_value = "")]
        purpose: String,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long)]
        memory_mb: Option<u32>,
        #[arg(long)]
        disk_gb: Option<u32>,
        #[arg(long)]
        lease_days: Option<i64>,
    },
    /// Start the domain of an active VM (e.g. after a host reboot)
    Start { name: String },
    /// Reboot a running VM in place
    Reboot { name: String },
    /// Gracefully shut down a VM and mark it suspended
    Stop { name: String },
    /// Force power-off a VM and mark it suspended
    Kill { name: String },
    /// Re-activate a suspended VM
    Resume {
        name: String,
        /// Renew the lease: new expiry is now plus this many days
        #[arg(long)]
        extend_days: Option<i64>,
    },
    /// Tear down a VM and release its resources (idempotent)
    Destroy { name: String },
    /// Report the live hypervisor state of a VM
    Status { name: String },
    /// List all VM records with their live state
    List {
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Garbage-collect expired leases (dry run unless --execute)
    Gc {
        /// Actually suspend/destroy instead of only reporting
        #[arg(long)]
        execute: bool,
        /// Only the suspend phase
        #[arg(long, conflicts_with = "destroy_only")]
        suspend_only: bool,
        /// Only the destroy phase
        #[arg(long)]
        destroy_only: bool,
        /// Override the configured grace period for this pass
        #[arg(long)]
        grace_days: Option<i64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = logging::init("vmleased");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// The JSON object `create` prints on success: `status: ok` plus the
/// connection details the owner needs, with optional fields only when
/// present.
fn create_summary(outcome: &vmleased::vm::CreateOutcome) -> serde_json::Value {
    let mut summary = json!({
        "status": "ok",
        "vm_name": outcome.record.name,
        "ip": outcome.record.ipv4.to_string(),
        "username": outcome.username,
        "expires_at": outcome.record.expires_at.to_rfc3339(),
    });
    if let Some(v6) = outcome.record.ipv6 {
        summary["ipv6"] = json!(v6.to_string());
    }
    if let Some(id) = outcome.record.vmid {
        summary["vmid"] = json!(id);
    }
    if let Some(tx) = &outcome.mint_tx {
        summary["mint_tx"] = json!(tx);
    }
    summary
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;
    let agent = Arc::new(AgentClient::new(&config.agent_socket));
    let orch = Orchestrator::new(config, agent).context("opening VM database")?;

    match cli.command {
        Command::Create {
            name,
            owner,
            wallet,
            purpose,
            cpus,
            memory_mb,
            disk_gb,
            lease_days,
        } => {
            let opts = CreateOpts {
                owner,
                wallet_address: wallet,
                purpose,
                cpus,
                memory_mb,
                disk_gb,
                lease_days,
            };
            let outcome = orch.create(&name, opts).await?;
            println!("{}", serde_json::to_string_pretty(&create_summary(&outcome))?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Start { name } => {
            orch.start(&name).await?;
            println!("{name} started");
            Ok(ExitCode::SUCCESS)
        }
        Command::Reboot { name } => {
            orch.reboot(&name).await?;
            println!("{name} rebooting");
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop { name } => {
            orch.stop(&name).await?;
            println!("{name} suspended");
            Ok(ExitCode::SUCCESS)
        }
        Command::Kill { name } => {
            orch.kill(&name).await?;
            println!("{name} killed and suspended");
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume { name, extend_days } => {
            let record = orch.resume(&name, extend_days).await?;
            println!("{name} resumed; lease expires {}", record.expires_at.to_rfc3339());
            Ok(ExitCode::SUCCESS)
        }
        Command::Destroy { name } => {
            let report = orch.destroy(&name).await?;
            for step in &report.steps {
                println!("{:<12} {}", step.step, step.outcome);
            }
            if report.ok() {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("destroy of {name} failed; rerun to retry");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Status { name } => {
            // Always exits 0; failures degrade to "unknown".
            match orch.status(&name).await {
                Ok(state) => println!("{state}"),
                Err(e) => {
                    error!(name, error = %e, "status query failed");
                    println!("unknown");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::List { format } => {
            match orch.list().await {
                Ok(listings) if format == OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&listings)?);
                }
                Ok(listings) => {
                    println!(
                        "{:<20} {:<10} {:<10} {:<16} {:<12} EXPIRES",
                        "NAME", "STATUS", "LIVE", "IPV4", "OWNER"
                    );
                    for l in &listings {
                        println!(
                            "{:<20} {:<10} {:<10} {:<16} {:<12} {}",
                            l.record.name,
                            l.record.status,
                            l.live.map(|s| s.as_str()).unwrap_or("-"),
                            l.record.ipv4,
                            l.record.owner,
                            l.record.expires_at.format("%Y-%m-%d"),
                        );
                    }
                }
                Err(e) => error!(error = %e, "list failed"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Gc {
            execute,
            suspend_only,
            destroy_only,
            grace_days,
        } => {
            let opts = gc::GcOptions {
                execute,
                suspend_only,
                destroy_only,
                grace_days,
            };
            let report = gc::run(&orch, &opts).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if execute && !report.clean() {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}
