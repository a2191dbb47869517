// src/config.rs

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Tunables for the service, its engines and their sources.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Scopes resource URIs and discovery interfaces.
    pub namespace: String,
    pub log_level: String,
    /// Size of a single read from an HTTP stream.
    pub http_read_size: usize,
    pub http_timeout: Duration,
    /// How long an idle HTTP session is kept open waiting for more blocks.
    pub http_idle_linger: Duration,
    pub peer_chunk_reliable: usize,
    pub peer_chunk_unreliable: usize,
    /// Liveness check period while a peer request is in flight.
    pub peer_poll_interval: Duration,
    pub discovery_interval: Duration,
    pub peer_timeout: Duration,
    pub monitor_interval: Duration,
    pub speed_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            namespace: "blockshare".to_string(),
            log_level: "info".to_string(),
            http_read_size: 16 * 1024,
            http_timeout: Duration::from_secs(30),
            http_idle_linger: Duration::from_secs(1),
            peer_chunk_reliable: 300 * 1024,
            peer_chunk_unreliable: 10 * 1024,
            peer_poll_interval: Duration::from_millis(100),
            discovery_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(120),
            monitor_interval: Duration::from_secs(5),
            speed_window: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `BLOCKSHARE_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var("BLOCKSHARE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(ns) = std::env::var("BLOCKSHARE_NAMESPACE") {
            cfg.namespace = ns;
        }
        if let Ok(level) = std::env::var("BLOCKSHARE_LOG") {
            cfg.log_level = level;
        }
        env_parse("BLOCKSHARE_HTTP_READ_SIZE", &mut cfg.http_read_size);
        env_parse("BLOCKSHARE_PEER_CHUNK_RELIABLE", &mut cfg.peer_chunk_reliable);
        env_parse("BLOCKSHARE_PEER_CHUNK_UNRELIABLE", &mut cfg.peer_chunk_unreliable);
        env_secs("BLOCKSHARE_HTTP_TIMEOUT_SECS", &mut cfg.http_timeout);
        env_secs("BLOCKSHARE_DISCOVERY_INTERVAL_SECS", &mut cfg.discovery_interval);
        env_secs("BLOCKSHARE_PEER_TIMEOUT_SECS", &mut cfg.peer_timeout);
        env_secs("BLOCKSHARE_MONITOR_INTERVAL_SECS", &mut cfg.monitor_interval);
        cfg
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

fn env_parse<T: FromStr>(key: &str, slot: &mut T) {
    match std::env::var(key).map(|v| v.parse::<T>()) {
        Ok(Ok(value)) => *slot = value,
        Ok(Err(_)) => tracing::warn!(key, "ignoring unparsable config value"),
        Err(_) => {}
    }
}

fn env_secs(key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    env_parse(key, &mut secs);
    *slot = Duration::from_secs(secs);
}

pub fn init_tracing(config: &EngineConfig) {
    // RUST_LOG wins over BLOCKSHARE_LOG, which wins over the default.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init();
}
