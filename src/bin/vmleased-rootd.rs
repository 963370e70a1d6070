//! vmleased-rootd: the privileged root agent.
//!
//! Listens on a Unix socket, validates each request against its allowlisted
//! action table, and runs the corresponding virsh/qemu-img command. This
//! process is the only part of vmleased that runs as root; everything it
//! will do is decided by the dispatch table in [`vmleased::agent::server`],
//! never by the unprivileged caller.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use vmleased::agent::server::{ServerCtx, serve};
use vmleased::config::Config;
use vmleased::logging;

#[derive(Parser, Debug)]
#[command(name = "vmleased-rootd", version, about = "Privileged agent for vmleased")]
struct Args {
    /// Config file (default: $VMLEASED_CONFIG, then /etc/vmleased/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen on this socket instead of the configured one
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init("vmleased-rootd");

    let config_path = Config::resolve_path(args.config.as_deref());
    let config = Config::load(&config_path)?;
    let socket_path = args.socket.unwrap_or_else(|| config.agent_socket.clone());
    let ctx = ServerCtx::from_config(&config);

    info!(socket = %socket_path.display(), "vmleased-rootd starting");
    serve(&socket_path, ctx).await
}
