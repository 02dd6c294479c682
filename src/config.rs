use std::path::PathBuf;
use std::time::Duration;

/// Per-engine tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on waiting for ledger locks before a mutation gives up.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Server settings, read from `SLOTGUARD_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| get(key).and_then(|s| s.parse::<u64>().ok());
        let lock_timeout_ms = parsed("SLOTGUARD_LOCK_TIMEOUT_MS").unwrap_or(5_000);
        Self {
            bind: get("SLOTGUARD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: get("SLOTGUARD_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(5433),
            data_dir: PathBuf::from(get("SLOTGUARD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("SLOTGUARD_PASSWORD").unwrap_or_else(|| "slotguard".into()),
            max_connections: parsed("SLOTGUARD_MAX_CONNECTIONS").unwrap_or(256) as usize,
            compact_threshold: parsed("SLOTGUARD_COMPACT_THRESHOLD").unwrap_or(1000),
            tls_cert: get("SLOTGUARD_TLS_CERT"),
            tls_key: get("SLOTGUARD_TLS_KEY"),
            metrics_port: get("SLOTGUARD_METRICS_PORT").and_then(|s| s.parse().ok()),
            engine: EngineConfig {
                lock_timeout: Duration::from_millis(lock_timeout_ms),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
