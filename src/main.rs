use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{info, warn};

use swarmd::config::DaemonConfig;
use swarmd::storage::{RaftStore, SqliteRaftStore};
use swarmd::AppContext;

#[derive(Parser)]
#[command(name = "swarmd", about = "Multi-agent control plane daemon", version)]
struct Args {
    /// WebSocket gateway bind host.
    #[arg(long, env = "SWARMD_HOST")]
    host: Option<String>,

    /// WebSocket gateway bind port.
    #[arg(long, env = "SWARMD_PORT")]
    port: Option<u16>,

    /// Data directory for the Raft SQLite store and config.toml.
    #[arg(long, env = "SWARMD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SWARMD_LOG")]
    log: Option<String>,

    /// This node's Raft identity. Defaults to a random id if unset.
    #[arg(long, env = "SWARMD_NODE_ID")]
    node_id: Option<String>,

    /// Comma-separated peer node ids for the Raft cluster. Empty means single-node.
    #[arg(long, env = "SWARMD_PEERS", value_delimiter = ',')]
    peers: Option<Vec<String>>,

    /// Write logs to this file path (rotated daily), in addition to stdout.
    #[arg(long, env = "SWARMD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = setup_logging(&log_level, args.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "swarmd starting");

    let config = DaemonConfig::new(args.host, args.port, args.data_dir, args.log, args.node_id, args.peers);
    info!(
        node_id = %config.node_id,
        host = %config.host,
        port = config.port,
        peers = config.peers.len(),
        data_dir = %config.data_dir.display(),
        "config loaded"
    );
    let config = Arc::new(config);

    let raft_store: Arc<dyn RaftStore> = Arc::new(
        SqliteRaftStore::new(&config.data_dir)
            .await
            .context("failed to open raft store")?,
    );

    let ctx = AppContext::build(config, raft_store)
        .await
        .context("failed to build application context")?;

    ctx.spawn_background_loops();

    let result = swarmd::gateway::run(ctx.clone()).await;
    ctx.shutdown().await;
    if let Err(e) = &result {
        warn!(err = %e, "gateway accept loop exited with error");
    }
    result.context("gateway accept loop failed")
}

/// Initializes the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file; the returned guard must stay alive for
/// the process lifetime. Falls back to stdout-only if the log directory
/// cannot be created — never panics on a bad log path.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("swarmd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level.to_string()))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
        None
    }
}
