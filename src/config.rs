//! Typed configuration (spec §A). Everything `spec.md` names as a tunable
//! lives here with the default it states; the config file is TOML, loaded
//! the way the teacher's `main.rs::config()` loads it.

use std::path::PathBuf;

use serde::Deserialize;

use crate::model::ServerKind;

fn default_tick_interval_secs() -> u64 {
    15
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cooldown_secs() -> u64 {
    900
}

fn default_critical_decrement() -> i64 {
    20
}

fn default_warning_decrement() -> i64 {
    10
}

fn default_info_decrement() -> i64 {
    5
}

fn default_watched_threshold_percent() -> i64 {
    85
}

fn default_idle_timeout_minutes() -> i64 {
    30
}

fn default_cascade_timeout_secs() -> u64 {
    15
}

fn default_maintenance_days() -> i64 {
    365
}

fn default_maintenance_max_height() -> i32 {
    720
}

fn default_maintenance_min_size_gb() -> f64 {
    10.0
}

fn default_household_min_sessions() -> i64 {
    3
}

fn default_household_auto_learn_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    pub id: i64,
    pub kind: ServerKind,
    pub name: String,
    pub url: String,
    pub api_key: String,
}

/// Rule cache + violation-dispatch tunables (spec §4.4).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    #[serde(rename = "cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    pub cooldown_secs: u64,
    pub critical_decrement: i64,
    pub warning_decrement: i64,
    pub info_decrement: i64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            cooldown_secs: default_cooldown_secs(),
            critical_decrement: default_critical_decrement(),
            warning_decrement: default_warning_decrement(),
            info_decrement: default_info_decrement(),
        }
    }
}

/// Poller/history tunables (spec §4.2, §4.3). `watched_threshold_percent`
/// and `idle_timeout_minutes` seed the repository's defaults; the engine
/// reads them back through `Repository::get_watched_threshold`/
/// `get_idle_timeout_minutes` rather than this struct directly, since the
/// spec treats both as runtime-adjustable state.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub tick_interval_secs: u64,
    pub watched_threshold_percent: i64,
    pub idle_timeout_minutes: i64,
    /// spec §9 "household auto-learn": gates whether `Poller::persist`
    /// invokes `Repository::auto_learn_household_location` at all.
    pub household_auto_learn_enabled: bool,
    pub household_min_sessions: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            watched_threshold_percent: default_watched_threshold_percent(),
            idle_timeout_minutes: default_idle_timeout_minutes(),
            household_auto_learn_enabled: default_household_auto_learn_enabled(),
            household_min_sessions: default_household_min_sessions(),
        }
    }
}

/// Defaults seeded into new `MaintenanceRule`s (spec §4.6).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub days: i64,
    pub max_height: i32,
    pub min_size_gb: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            days: default_maintenance_days(),
            max_height: default_maintenance_max_height(),
            min_size_gb: default_maintenance_min_size_gb(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RadarrConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SonarrConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OverseerrConfig {
    pub url: String,
    pub api_key: String,
}

/// Cascade-deleter tunables plus the optional companion-service clients
/// (spec §4.7). Any of the three may be absent; the deleter reports a
/// no-op for the services it has no client for.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub timeout_secs: u64,
    pub radarr: Option<RadarrConfig>,
    pub sonarr: Option<SonarrConfig>,
    pub overseerr: Option<OverseerrConfig>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_cascade_timeout_secs(),
            radarr: None,
            sonarr: None,
            overseerr: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    /// Number of retries for the initial per-server connection probe
    /// (spec §7: transient failures should not abort startup).
    #[serde(default)]
    pub connection_retries: usize,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<LogLevel>,
}
