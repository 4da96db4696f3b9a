//! `reefd`: the Reef volume control plane daemon.
//!
//! Binary entrypoint that wires the node registry, storage agents, volume
//! service and recovery worker together behind a JSON REST API.
//!
//! # Usage
//!
//! ```text
//! reefd start                                   # start the control plane
//! reefd start -c reef.toml                      # start with a config file
//! reefd start -d ./reef2 -l 127.0.0.1:4831      # second instance
//! reefd start --node node-a --node node-b       # serve two storage nodes
//! reefd status                                  # show volume and ledger counts
//! reefd cleanup list                            # show the pending-cleanup ledger
//! ```

mod api;
mod config;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reef_agent::{AgentDirectory, MemoryAgent, NodeAgent};
use reef_cluster::{NodeRegistry, liveness};
use reef_meta::MetaStore;
use reef_reconcile::{RecoveryWorker, VolumeService};
use reef_types::{NodeId, VolumeStatus};
use tokio::sync::watch;
use tracing::{error, info, warn};

use api::ApiServer;
use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "reefd", version, about = "Reef volume control plane daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane.
    Start {
        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override API listen address (e.g. "127.0.0.1:4831").
        #[arg(short = 'l', long)]
        listen_addr: Option<String>,

        /// Storage node(s) to serve with in-process agents.
        ///
        /// Can be specified multiple times. Replaces `[cluster] nodes`.
        #[arg(short, long, env = "REEF_NODES", value_delimiter = ',')]
        node: Vec<String>,

        /// Keep metadata in a temporary store discarded on exit.
        #[arg(short, long)]
        memory: bool,
    },

    /// Show volume and ledger counts from the local metadata store.
    Status,

    /// Pending-cleanup ledger operations.
    Cleanup {
        #[command(subcommand)]
        action: CleanupCommands,
    },
}

#[derive(Subcommand)]
enum CleanupCommands {
    /// List every pending-cleanup entry.
    List,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            listen_addr,
            node,
            memory,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(addr) = listen_addr {
                config.node.listen_addr = addr;
            }
            if !node.is_empty() {
                config.cluster.nodes = node;
            }
            if memory {
                config.node.memory = true;
            }
            cmd_start(config).await
        }
        Commands::Status => cmd_status(&config),
        Commands::Cleanup { action } => match action {
            CleanupCommands::List => cmd_cleanup_list(&config),
        },
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// reefd start
// -----------------------------------------------------------------------

/// Everything `start` wires together, minus the background tasks.
struct ControlPlane {
    registry: Arc<NodeRegistry>,
    service: Arc<VolumeService>,
    fleet: BTreeMap<NodeId, Arc<MemoryAgent>>,
}

/// Build the control plane over `meta`: one in-process agent per configured
/// storage node, and every recorded pool re-created on its agent.
async fn build_control_plane(config: &CliConfig, meta: Arc<MetaStore>) -> Result<ControlPlane> {
    let registry = NodeRegistry::new();
    let directory = AgentDirectory::new();
    let mut fleet = BTreeMap::new();

    for node in config.storage_nodes() {
        let agent = Arc::new(MemoryAgent::new(node.clone()));
        directory.insert(agent.clone());
        registry.register(node.clone());
        fleet.insert(node, agent);
    }

    let service = VolumeService::new(meta, registry.clone(), directory.clone(), config.reconcile);

    // In-process agents start empty; give them back their pools.
    for pool in service.list_pools().context("failed to list pools")? {
        match directory.get(&pool.node) {
            Some(agent) => {
                if let Err(e) = agent.create_pool(&pool).await {
                    warn!(pool = %pool.id, node = %pool.node, error = %e, "failed to restore pool");
                }
            }
            None => warn!(pool = %pool.id, node = %pool.node, "pool on unconfigured node"),
        }
    }

    Ok(ControlPlane {
        registry,
        service,
        fleet,
    })
}

async fn cmd_start(config: CliConfig) -> Result<()> {
    info!("starting reefd");
    info!(
        data_dir = %config.node.data_dir.display(),
        listen_addr = %config.node.listen_addr,
        memory = config.node.memory,
        operation_timeout_ms = config.reconcile.operation_timeout_ms,
        heartbeat_timeout_ms = config.cluster.liveness.heartbeat_timeout_ms,
        "control plane configuration"
    );

    // --- Metadata store ---
    let meta = if config.node.memory {
        info!("using temporary metadata store");
        Arc::new(MetaStore::open_temporary().context("failed to open temporary metadata store")?)
    } else {
        std::fs::create_dir_all(&config.node.data_dir)
            .context("failed to create data directory")?;
        Arc::new(MetaStore::open(config.meta_path()).context("failed to open metadata store")?)
    };

    let plane = build_control_plane(&config, meta).await?;
    info!(
        nodes = plane.fleet.len(),
        pools = plane.service.list_pools()?.len(),
        "storage nodes ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Recovery worker ---
    // Subscribed before anything can change node state.
    let worker = RecoveryWorker::new(plane.service.clone());
    let worker_task = tokio::spawn(
        worker
            .clone()
            .run(plane.registry.subscribe(), shutdown_rx.clone()),
    );

    // --- Liveness ---
    let liveness = liveness::start(config.cluster.liveness, plane.registry.clone());
    let heartbeat_task = tokio::spawn(local_heartbeats(
        plane.registry.clone(),
        plane.fleet.clone(),
        Duration::from_millis(config.cluster.liveness.check_interval_ms.max(1)),
        shutdown_rx,
    ));

    // --- Crash resume ---
    let resumed = plane
        .service
        .resume_interrupted()
        .await
        .context("failed to resume interrupted operations")?;
    if resumed > 0 {
        info!(resumed, "resumed interrupted volume operations");
    }
    let pending = plane.service.pending_cleanups()?.len();
    if pending > 0 {
        info!(pending, "pending cleanups will be replayed as nodes report in");
    }

    // --- REST API ---
    let server = ApiServer::new(plane.service.clone(), plane.fleet);
    server
        .serve_with_shutdown(&config.node.listen_addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        })
        .await
        .context("API server failed")?;

    // --- Shutdown ---
    let _ = shutdown_tx.send(true);
    liveness.shutdown();
    if let Err(e) = worker_task.await {
        warn!(error = %e, "recovery worker task failed");
    }
    if let Err(e) = heartbeat_task.await {
        warn!(error = %e, "heartbeat task failed");
    }
    info!(
        completed = worker.completed(),
        failed = worker.failed(),
        "reefd stopped"
    );
    Ok(())
}

/// Heartbeat every online in-process agent into the registry.
async fn local_heartbeats(
    registry: Arc<NodeRegistry>,
    fleet: BTreeMap<NodeId, Arc<MemoryAgent>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for (node, agent) in &fleet {
                    if agent.is_online() {
                        registry.record_heartbeat(node);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

// -----------------------------------------------------------------------
// reefd status / cleanup list
// -----------------------------------------------------------------------

fn open_existing_meta(config: &CliConfig) -> Result<MetaStore> {
    let meta_path = config.meta_path();
    MetaStore::open(&meta_path).map_err(|e| {
        error!(path = %meta_path.display(), %e, "failed to open metadata store");
        anyhow::anyhow!(
            "cannot open metadata at {}. Is reefd running? ({e})",
            meta_path.display(),
        )
    })
}

fn cmd_status(config: &CliConfig) -> Result<()> {
    let meta = open_existing_meta(config)?;
    print!("{}", status_report(&meta)?);
    Ok(())
}

/// Volume counts by status, pool count, and ledger size.
fn status_report(meta: &MetaStore) -> Result<String> {
    let volumes = meta.list_volumes()?;
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for volume in &volumes {
        *by_status.entry(status_name(volume.status)).or_default() += 1;
    }

    let mut out = format!("Volumes: {}\n", volumes.len());
    for (status, count) in &by_status {
        out.push_str(&format!("  {status}: {count}\n"));
    }
    out.push_str(&format!("Pools: {}\n", meta.list_pools()?.len()));
    out.push_str(&format!("Pending cleanups: {}\n", meta.pending_len()?));
    Ok(out)
}

fn status_name(status: VolumeStatus) -> String {
    format!("{status:?}").to_lowercase()
}

fn cmd_cleanup_list(config: &CliConfig) -> Result<()> {
    let meta = open_existing_meta(config)?;
    let entries = meta.list_pending()?;
    if entries.is_empty() {
        println!("No pending cleanups.");
        return Ok(());
    }
    println!("Pending cleanups: {}", entries.len());
    for entry in &entries {
        println!(
            "  {} task={} attempts={} timeouts={} next_attempt_ms={} last_error={}",
            entry.key(),
            entry.task.kind(),
            entry.attempts,
            entry.timeouts,
            entry.next_attempt_ms,
            entry.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
