use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 18801;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_STALE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_STALE_DETECTOR_INTERVAL_SECS: u64 = 30;
const DEFAULT_TOKEN_CLEANUP_SECS: u64 = 300;
const DEFAULT_ELECTION_MIN_MS: u64 = 150;
const DEFAULT_ELECTION_MAX_MS: u64 = 300;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 50;
const DEFAULT_ASSIGNMENT_TICK_MS: u64 = 100;
const DEFAULT_MONITOR_TICK_SECS: u64 = 10;
const DEFAULT_REBALANCE_TICK_SECS: u64 = 30;
const DEFAULT_MAX_TASK_DURATION_SECS: u64 = 3600;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// `{data_dir}/config.toml` — every field is an optional override.
/// Priority: CLI / env  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    host: Option<String>,
    port: Option<u16>,
    log: Option<String>,
    node_id: Option<String>,
    peers: Option<Vec<String>>,
    heartbeat_secs: Option<u64>,
    stale_timeout_secs: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Tunable timers for the control-plane loops. Kept independent per §10.8 of
/// the design notes — none derives its period from another.
#[derive(Debug, Clone)]
pub struct Timers {
    pub heartbeat_interval: std::time::Duration,
    pub heartbeat_timeout: std::time::Duration,
    pub stale_timeout: std::time::Duration,
    /// How often the presence stale-detector sweep runs — independent of
    /// `stale_timeout`, the threshold it checks against (SPEC_FULL.md §4.4).
    pub stale_detector_interval: std::time::Duration,
    pub token_cleanup_interval: std::time::Duration,
    pub election_timeout_min: std::time::Duration,
    pub election_timeout_max: std::time::Duration,
    pub raft_heartbeat_interval: std::time::Duration,
    pub assignment_tick: std::time::Duration,
    pub monitor_tick: std::time::Duration,
    pub rebalance_tick: std::time::Duration,
    pub max_task_duration: std::time::Duration,
}

impl Default for Timers {
    fn default() -> Self {
        use std::time::Duration;
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_SECS * 2),
            stale_timeout: Duration::from_secs(DEFAULT_STALE_TIMEOUT_SECS),
            stale_detector_interval: Duration::from_secs(DEFAULT_STALE_DETECTOR_INTERVAL_SECS),
            token_cleanup_interval: Duration::from_secs(DEFAULT_TOKEN_CLEANUP_SECS),
            election_timeout_min: Duration::from_millis(DEFAULT_ELECTION_MIN_MS),
            election_timeout_max: Duration::from_millis(DEFAULT_ELECTION_MAX_MS),
            raft_heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            assignment_tick: Duration::from_millis(DEFAULT_ASSIGNMENT_TICK_MS),
            monitor_tick: Duration::from_secs(DEFAULT_MONITOR_TICK_SECS),
            rebalance_tick: Duration::from_secs(DEFAULT_REBALANCE_TICK_SECS),
            max_task_duration: Duration::from_secs(DEFAULT_MAX_TASK_DURATION_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// This node's Raft identity. Defaults to a random id if unset.
    pub node_id: String,
    /// Peer node ids for the Raft cluster. Empty means single-node.
    pub peers: Vec<String>,
    pub max_attempts: u32,
    pub timers: Timers,
}

impl DaemonConfig {
    /// Build config from CLI/env args plus an optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        host: Option<String>,
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        node_id: Option<String>,
        peers: Option<Vec<String>>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let host = host.or(toml.host).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let node_id = node_id
            .or(toml.node_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let peers = peers.or(toml.peers).unwrap_or_default();

        let mut timers = Timers::default();
        if let Some(secs) = toml.heartbeat_secs {
            timers.heartbeat_interval = std::time::Duration::from_secs(secs);
            timers.heartbeat_timeout = std::time::Duration::from_secs(secs * 2);
        }
        if let Some(secs) = toml.stale_timeout_secs {
            timers.stale_timeout = std::time::Duration::from_secs(secs);
        }

        Self {
            host,
            port,
            data_dir,
            log,
            node_id,
            peers,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timers,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("swarmd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("swarmd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("swarmd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("swarmd");
        }
    }
    PathBuf::from(".swarmd")
}
