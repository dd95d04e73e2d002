//! nagent-node: Node Agent daemon.

use anyhow::{Context, Result};
use clap::Parser;
use nagent_node::config::DEFAULT_PORT;
use nagent_node::{NodeAgent, NodeConfig, RegistryLimits, launch, load_verifier, signals};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// nagent Node Agent
#[derive(Parser, Debug)]
#[command(name = "nagent-node", version, about)]
struct Args {
    /// Address for control datagrams
    #[arg(long, env = "NAGENT_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    listen: SocketAddr,

    /// Controller address receiving task exit reports
    #[arg(long, env = "NAGENT_CONTROLLER")]
    controller: Option<SocketAddr>,

    /// Node name (defaults to hostname)
    #[arg(long, env = "NAGENT_NODE_NAME")]
    node_name: Option<String>,

    /// Maximum concurrent job steps
    #[arg(long, default_value = "64")]
    max_steps: usize,

    /// Maximum concurrent tasks
    #[arg(long, default_value = "256")]
    max_tasks: usize,

    /// Maximum tasks per job step
    #[arg(long, default_value = "128")]
    max_tasks_per_step: usize,

    /// Relay buffer size in bytes
    #[arg(long, default_value = "4096")]
    buffer_size: usize,

    /// File holding the secret shared with the controller
    #[arg(long, env = "NAGENT_CREDENTIAL_FILE")]
    credential_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Before any thread exists, so every thread inherits the mask.
    let sigset = signals::block_shutdown_signals().context("Failed to block signals")?;
    launch::reserve_standard_fds().context("Failed to reserve standard descriptors")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nagent_node=info,nagent_proto=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let node_name = args.node_name.unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    info!("Starting nagent-node: {}", node_name);

    let config = NodeConfig {
        listen: args.listen,
        controller: args.controller,
        node_name,
        limits: RegistryLimits {
            max_steps: args.max_steps,
            max_tasks: args.max_tasks,
            max_tasks_per_step: args.max_tasks_per_step,
        },
        buffer_size: args.buffer_size,
        credential_file: args.credential_file,
        ..NodeConfig::default()
    };

    let verifier = load_verifier(config.credential_file.as_deref())?;
    let shutdown = Arc::new(AtomicBool::new(false));
    signals::spawn_shutdown_waiter(sigset, Arc::clone(&shutdown))
        .context("Failed to start signal thread")?;

    let agent = NodeAgent::new(config, verifier).context("Failed to start node agent")?;
    agent.run(&shutdown)?;
    agent.shutdown()?;
    Ok(())
}
