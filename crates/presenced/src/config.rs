use presence_core::{CoordinatorConfig, LivenessConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the MobileFaceNet ONNX model.
    pub model_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Tenant whose gallery this kiosk serves.
    pub tenant: String,
    /// Maximum cosine distance for a recognition candidate.
    pub rejection_threshold: f32,
    /// Maximum cosine distance at which an enrollment is a duplicate.
    pub duplicate_threshold: f32,
    /// Seconds during which a repeat check-in is suppressed.
    pub cooldown_secs: u64,
    /// Consecutive qualifying frames required after a blink.
    pub required_stability: u32,
    /// Consecutive unmatched frames tolerated before a session resets.
    pub max_unmatched_retries: u32,
    /// Use the session bus instead of the system bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let model_path = std::env::var("PRESENCE_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models/mobilefacenet.onnx"));

        let db_path = std::env::var("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("presence.db"));

        Self {
            model_path,
            db_path,
            tenant: std::env::var("PRESENCE_TENANT").unwrap_or_else(|_| "default".to_string()),
            rejection_threshold: env_f32("PRESENCE_REJECTION_THRESHOLD", 0.42),
            duplicate_threshold: env_f32("PRESENCE_DUPLICATE_THRESHOLD", 0.22),
            cooldown_secs: env_u64("PRESENCE_COOLDOWN_SECS", 20),
            required_stability: env_u32("PRESENCE_REQUIRED_STABILITY", 4),
            max_unmatched_retries: env_u32("PRESENCE_MAX_UNMATCHED_RETRIES", 15),
            session_bus: std::env::var("PRESENCE_SESSION_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    /// The core pipeline configuration derived from this daemon config.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            rejection_threshold: self.rejection_threshold,
            duplicate_threshold: self.duplicate_threshold,
            cooldown_window: Duration::from_secs(self.cooldown_secs),
            liveness: LivenessConfig {
                required_stability: self.required_stability,
                max_unmatched_retries: self.max_unmatched_retries,
                ..LivenessConfig::default()
            },
            ..CoordinatorConfig::default()
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

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
