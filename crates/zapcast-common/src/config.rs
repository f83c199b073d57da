//! Configuration for Zapcast

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "ZAPCAST_CONFIG";

/// Prefix for environment overrides (`ZAPCAST__DISPATCH__MAX_RUNTIME_SECS=30`)
pub const ENV_PREFIX: &str = "ZAPCAST";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Dispatch loop configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Periodic sweep configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Message transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on every non-health route
    pub trigger_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            trigger_token: None,
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Dispatch loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on a single invocation's wall time
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,

    /// Upper bound on send attempts per invocation
    #[serde(default = "default_max_messages_per_run")]
    pub max_messages_per_run: u32,

    /// Pause between an exhausted invocation and its continuation
    #[serde(default = "default_reinvoke_delay_secs")]
    pub reinvoke_delay_secs: u64,

    /// Minimum gap between sends from one device, indexed by warm-up level (1-based).
    /// Levels above the table use the last entry.
    #[serde(default = "default_warmup_gaps_secs")]
    pub warmup_gaps_secs: Vec<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_runtime_secs: default_max_runtime_secs(),
            max_messages_per_run: default_max_messages_per_run(),
            reinvoke_delay_secs: default_reinvoke_delay_secs(),
            warmup_gaps_secs: default_warmup_gaps_secs(),
        }
    }
}

fn default_max_runtime_secs() -> u64 {
    50
}

fn default_max_messages_per_run() -> u32 {
    500
}

fn default_reinvoke_delay_secs() -> u64 {
    2
}

fn default_warmup_gaps_secs() -> Vec<u64> {
    vec![120, 60, 30, 15, 8]
}

/// Periodic sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between sweep ticks
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// A sending campaign with no progress for this long is considered stalled
    #[serde(default = "default_stale_threshold_minutes")]
    pub stale_threshold_minutes: i64,

    /// Run the stall detector every N ticks
    #[serde(default = "default_stall_every_ticks")]
    pub stall_every_ticks: u32,

    /// Orphaned messages are requeued at most this many times before failing
    #[serde(default = "default_max_reclaim_attempts")]
    pub max_reclaim_attempts: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            stale_threshold_minutes: default_stale_threshold_minutes(),
            stall_every_ticks: default_stall_every_ticks(),
            max_reclaim_attempts: default_max_reclaim_attempts(),
        }
    }
}

fn default_tick_secs() -> u64 {
    30
}

fn default_stale_threshold_minutes() -> i64 {
    30
}

fn default_stall_every_ticks() -> u32 {
    2
}

fn default_max_reclaim_attempts() -> i32 {
    3
}

/// Message transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Base URL of the device gateway
    #[serde(default = "default_transport_url")]
    pub base_url: String,

    /// API key sent with every gateway request
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_transport_timeout")]
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_transport_url(),
            api_key: None,
            timeout_secs: default_transport_timeout(),
        }
    }
}

fn default_transport_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_transport_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,zapcast=debug".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from a TOML file without environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from the first config file found, layered with
    /// `ZAPCAST__*` environment overrides
    pub fn load() -> crate::Result<Self> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("./config.toml"));
        paths.push(PathBuf::from("/etc/zapcast/config.toml"));

        let mut builder = ::config::Config::builder();
        if let Some(path) = paths.iter().find(|p| p.exists()) {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path.as_path()));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.dispatch.max_runtime_secs, 50);
        assert_eq!(config.dispatch.warmup_gaps_secs, vec![120, 60, 30, 15, 8]);
        assert_eq!(config.scheduler.stale_threshold_minutes, 30);
        assert_eq!(config.scheduler.max_reclaim_attempts, 3);
        assert!(config.api.trigger_token.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://localhost/zapcast"

[dispatch]
max_runtime_secs = 20
warmup_gaps_secs = [90, 45]

[scheduler]
stale_threshold_minutes = 15

[transport]
base_url = "https://gateway.example.com"
api_key = "secret"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://localhost/zapcast")
        );
        assert_eq!(config.dispatch.max_runtime_secs, 20);
        assert_eq!(config.dispatch.max_messages_per_run, 500);
        assert_eq!(config.dispatch.warmup_gaps_secs, vec![90, 45]);
        assert_eq!(config.scheduler.stale_threshold_minutes, 15);
        assert_eq!(config.scheduler.tick_secs, 30);
        assert_eq!(config.transport.base_url, "https://gateway.example.com");
        assert_eq!(config.logging.format, "json");
    }
}
