use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Listen address for the HTTP/WebSocket surface.
    pub bind_addr: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Embedding provider endpoint (raw image in, detected faces out).
    pub provider_url: String,
    /// Timeout in seconds for one embedding-extraction call.
    pub provider_timeout_secs: u64,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Minimum seconds between two accepted events of the same type for
    /// the same identity. Continuous streaming submits a frame per tick,
    /// so this is minutes, not seconds.
    pub cooldown_secs: u64,
    /// Embedding dimensionality fixed by the provider.
    pub embedding_dim: usize,
}

impl Config {
    /// Load configuration from `TALLY_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("tally");

        let db_path = std::env::var("TALLY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            bind_addr: std::env::var("TALLY_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8095".to_string()),
            db_path,
            provider_url: std::env::var("TALLY_PROVIDER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8500/embed".to_string()),
            provider_timeout_secs: env_u64("TALLY_PROVIDER_TIMEOUT_SECS", 10),
            similarity_threshold: env_f32("TALLY_SIMILARITY_THRESHOLD", 0.60),
            cooldown_secs: env_u64("TALLY_COOLDOWN_SECS", 300),
            embedding_dim: env_usize("TALLY_EMBEDDING_DIM", 512),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
