use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 30;
pub const DEFAULT_HORIZON_DAYS: u32 = 365;
pub const DEFAULT_DRIFT_TOLERANCE_SECS: i64 = 60;
pub const DEFAULT_QUOTA_SWEEP_SECS: u64 = 24 * 60 * 60;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
///
/// Nested keys are separated by a double underscore in env vars, e.g.
/// `CADENCE_SCHEDULER__POLL_INTERVAL_MS=500`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub bookings: BookingsConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Status transition scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// When false, no transition tasks are armed and none fire.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// How often the engine polls the task table for due tasks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Capacity of the fired-task channel between engine and router.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Delay before a task whose handling hit a transient store error is
    /// claimed again.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingsConfig {
    /// Materialization horizon for patterns that have no end date.
    #[serde(default = "default_horizon_days")]
    pub open_ended_horizon_days: u32,
    /// Maximum distance from the canonical slot for an occurrence to still
    /// count as following its pattern.
    #[serde(default = "default_drift_tolerance_secs")]
    pub drift_tolerance_secs: i64,
}

impl Default for BookingsConfig {
    fn default() -> Self {
        Self {
            open_ended_horizon_days: DEFAULT_HORIZON_DAYS,
            drift_tolerance_secs: DEFAULT_DRIFT_TOLERANCE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_quota_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_QUOTA_SWEEP_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback `EnvFilter` directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
fn default_horizon_days() -> u32 {
    DEFAULT_HORIZON_DAYS
}
fn default_drift_tolerance_secs() -> i64 {
    DEFAULT_DRIFT_TOLERANCE_SECS
}
fn default_quota_sweep_secs() -> u64 {
    DEFAULT_QUOTA_SWEEP_SECS
}
fn default_log_filter() -> String {
    "cadence_daemon=info,cadence_bookings=info,cadence_scheduler=info".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Uses the explicit path when given, otherwise ~/.cadence/cadence.toml.
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
