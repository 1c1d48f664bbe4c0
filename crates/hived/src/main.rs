//! Hive control-plane daemon (hived).
//!
//! Supervises the storage engines on one host and brings each of them into
//! the cluster.
//!
//! Usage:
//!   hived [OPTIONS] --scm-mount <DIR> [--scm-mount <DIR> ...]
//!
//! The daemon creates a tokio async runtime and runs:
//! 1. One supervision loop per engine instance
//! 2. The dRPC listener that engines report readiness on
//! 3. An event logger on the instance event bus
//! 4. A formatter for instances awaiting storage, when `--format` is given

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hive_core::DrpcServer;
use hive_proto::defaults::{
    CONTROL_SOCKET_NAME, DEFAULT_AUTHORITY_PORT, DEFAULT_ENGINE_BIN, DEFAULT_HUGEPAGE_SIZE_MB,
    DEFAULT_JOIN_TIMEOUT, DEFAULT_SOCKET_DIR, DEFAULT_TARGET_COUNT,
};
use hive_proto::FaultDomain;

use hived::instance::await_format_fn;
use hived::membership::TcpMembershipClient;
use hived::runner::{EngineConfig, ProcessRunner};
use hived::storage::StorageProvider;
use hived::{log_events, EngineHarness, EngineInstance, EventPublisher};

/// Hive control-plane daemon
#[derive(Parser, Debug)]
#[command(name = "hived", version, about = "Hive control-plane daemon")]
struct Args {
    /// SCM mount point, one per engine
    #[arg(long = "scm-mount", value_name = "DIR", required = true)]
    scm_mounts: Vec<PathBuf>,

    /// Number of engines to run (default: one per SCM mount)
    #[arg(short = 'e', long)]
    engines: Option<usize>,

    /// Engine binary
    #[arg(long, default_value = DEFAULT_ENGINE_BIN)]
    engine_bin: PathBuf,

    /// Directory for dRPC sockets
    #[arg(long, default_value = DEFAULT_SOCKET_DIR)]
    socket_dir: PathBuf,

    /// Membership authority address
    #[arg(short = 'a', long, value_name = "HOST:PORT")]
    authority: Option<SocketAddr>,

    /// Fault domain of this host, e.g. /rack0/host3
    #[arg(long, default_value = "/")]
    fault_domain: FaultDomain,

    /// Name of the system written into new superblocks
    #[arg(long, default_value = "hive")]
    system: String,

    /// Targets per engine
    #[arg(short = 't', long, default_value_t = DEFAULT_TARGET_COUNT)]
    targets: u32,

    /// Engine memory size in MB (0 = engine default)
    #[arg(long, default_value_t = 0)]
    mem_size: u32,

    /// Hugepage size in MB
    #[arg(long, default_value_t = DEFAULT_HUGEPAGE_SIZE_MB)]
    hugepage_size: u32,

    /// Format instances that have no superblock instead of waiting
    #[arg(long)]
    format: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("hived v{} starting", env!("CARGO_PKG_VERSION"));

    let nr_engines = args.engines.unwrap_or(args.scm_mounts.len());
    if nr_engines == 0 || nr_engines > args.scm_mounts.len() {
        error!(
            "{} engine(s) requested but {} SCM mount(s) given",
            nr_engines,
            args.scm_mounts.len()
        );
        std::process::exit(1);
    }

    if let Err(e) = tokio::fs::create_dir_all(&args.socket_dir).await {
        error!(
            "failed to create socket directory {}: {}",
            args.socket_dir.display(),
            e
        );
        std::process::exit(1);
    }

    let authority = args.authority.unwrap_or_else(|| {
        SocketAddr::from(([127, 0, 0, 1], DEFAULT_AUTHORITY_PORT))
    });
    let membership =
        Arc::new(TcpMembershipClient::new(authority).with_timeout(DEFAULT_JOIN_TIMEOUT));
    let events = EventPublisher::default();
    info!("membership authority {}", authority);

    // ---------------------------------------------------------------
    // Build engine instances
    // ---------------------------------------------------------------
    // Instances awaiting a format report their index here.
    let (format_tx, mut format_rx) = mpsc::unbounded_channel::<u32>();
    let mut harness = EngineHarness::new();
    for (idx, scm_mount) in args.scm_mounts.iter().take(nr_engines).enumerate() {
        let config = EngineConfig {
            index: idx as u32,
            target_count: args.targets,
            mem_size_mb: args.mem_size,
            hugepage_size_mb: args.hugepage_size,
            binary: args.engine_bin.clone(),
            scm_mount: scm_mount.clone(),
            socket_dir: args.socket_dir.clone(),
            ..Default::default()
        };
        let mut inst = EngineInstance::new(
            config,
            StorageProvider::new(scm_mount),
            membership.clone(),
            Arc::new(ProcessRunner::new()),
            events.clone(),
        )
        .with_host_fault_domain(args.fault_domain.clone());
        let auto_format = args.format;
        let format_tx = format_tx.clone();
        inst.on_await_format([await_format_fn(move |idx, mount| {
            let format_tx = format_tx.clone();
            async move {
                if auto_format {
                    info!("instance {}: formatting {}", idx, mount.display());
                    let _ = format_tx.send(idx);
                } else {
                    warn!(
                        "instance {} needs formatting: no superblock on {} (restart with --format)",
                        idx,
                        mount.display()
                    );
                }
                Ok(())
            }
        })]);

        if let Err(e) = harness.add_instance(inst).await {
            error!("failed to add engine instance {}: {}", idx, e);
            std::process::exit(1);
        }
    }
    drop(format_tx);
    let harness = Arc::new(harness);

    // ---------------------------------------------------------------
    // Spawn formatter
    // ---------------------------------------------------------------
    let formatter = harness.clone();
    let system = args.system.clone();
    tokio::spawn(async move {
        while let Some(idx) = format_rx.recv().await {
            if let Err(e) = formatter.format_instance(idx, &system).await {
                error!("instance {}: format failed: {}", idx, e);
            }
        }
    });

    // ---------------------------------------------------------------
    // Spawn event logger
    // ---------------------------------------------------------------
    tokio::spawn(log_events(events.subscribe()));

    // ---------------------------------------------------------------
    // Spawn dRPC listener
    // ---------------------------------------------------------------
    let token = CancellationToken::new();
    let server = DrpcServer::new(args.socket_dir.join(CONTROL_SOCKET_NAME), harness.clone());
    let server_token = token.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_token).await {
            error!("dRPC listener failed: {}", e);
        }
    });

    harness.start().await;
    info!("hived ready with {} engine(s)", nr_engines);

    // Wait for shutdown signal
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutting down");
    for st in harness.status().await {
        info!(
            "instance {}: {:?}, rank {}, {} target(s){}",
            st.index,
            st.state,
            st.rank.map_or_else(|| "none".to_string(), |r| r.to_string()),
            st.target_count,
            st.last_error
                .map(|e| format!(", last error: {}", e))
                .unwrap_or_default()
        );
    }

    harness.stop().await;
    token.cancel();
    if let Err(e) = server_task.await {
        warn!("dRPC listener task failed: {}", e);
    }
    info!("hived stopped");
}
