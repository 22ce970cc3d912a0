use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://lot_ledger.db?mode=rwc";
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_ALLOCATION_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 25;
const DEFAULT_LOT_SWEEP_INTERVAL_SECS: u64 = 86_400; // daily
const DEFAULT_RESERVATION_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_EXPIRY_ALERT_DAYS: &str = "90,30,7";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub log_json: bool,

    /// Run embedded migrations on startup
    #[serde(default = "default_true")]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 512))]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// How many times a reservation or issue re-runs from a fresh FEFO read
    /// after losing an optimistic-lock race
    #[serde(default = "default_allocation_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub allocation_max_attempts: u32,

    /// Linear backoff between allocation attempts, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_lot_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub lot_sweep_interval_secs: u64,

    #[serde(default = "default_reservation_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub reservation_sweep_interval_secs: u64,

    /// Comma separated day offsets that raise expiring-soon alerts
    #[serde(default = "default_expiry_alert_days")]
    #[validate(custom = "validate_expiry_alert_days")]
    pub expiry_alert_days: String,

    /// Reservations created without an explicit expiry get this TTL
    #[serde(default)]
    pub default_reservation_ttl_secs: Option<u64>,

    /// Comma separated `material_id=quantity` reorder thresholds checked on
    /// every lot sweep
    #[serde(default)]
    #[validate(custom = "validate_low_stock_thresholds")]
    pub low_stock_thresholds: String,
}

impl AppConfig {
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            allocation_max_attempts: default_allocation_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lot_sweep_interval_secs: default_lot_sweep_interval_secs(),
            reservation_sweep_interval_secs: default_reservation_sweep_interval_secs(),
            expiry_alert_days: default_expiry_alert_days(),
            default_reservation_ttl_secs: None,
            low_stock_thresholds: String::new(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Parsed alert offsets, largest first. Invalid entries are rejected by validation.
    pub fn expiry_alert_days(&self) -> Vec<i64> {
        let mut days: Vec<i64> = self
            .expiry_alert_days
            .split(',')
            .filter_map(|d| d.trim().parse::<i64>().ok())
            .collect();
        days.sort_unstable_by(|a, b| b.cmp(a));
        days.dedup();
        days
    }

    /// Parsed reorder thresholds. Invalid entries are rejected by validation.
    pub fn low_stock_thresholds(&self) -> BTreeMap<Uuid, Decimal> {
        self.low_stock_thresholds
            .split(',')
            .filter_map(parse_threshold)
            .collect()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn lot_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lot_sweep_interval_secs)
    }

    pub fn reservation_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.reservation_sweep_interval_secs)
    }

    pub fn default_reservation_ttl(&self) -> Option<chrono::Duration> {
        self.default_reservation_ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }
}

/// Custom error type for configuration operations
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_true() -> bool {
    true
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_db_idle_timeout_secs() -> u64 {
    600
}

fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn default_allocation_max_attempts() -> u32 {
    DEFAULT_ALLOCATION_MAX_ATTEMPTS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_lot_sweep_interval_secs() -> u64 {
    DEFAULT_LOT_SWEEP_INTERVAL_SECS
}

fn default_reservation_sweep_interval_secs() -> u64 {
    DEFAULT_RESERVATION_SWEEP_INTERVAL_SECS
}

fn default_expiry_alert_days() -> String {
    DEFAULT_EXPIRY_ALERT_DAYS.to_string()
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_expiry_alert_days(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Ok(());
    }
    for part in value.split(',') {
        match part.trim().parse::<i64>() {
            Ok(days) if days > 0 => {}
            _ => {
                let mut err = ValidationError::new("expiry_alert_days");
                err.message =
                    Some("Must be a comma separated list of positive day counts".into());
                return Err(err);
            }
        }
    }
    Ok(())
}

fn parse_threshold(entry: &str) -> Option<(Uuid, Decimal)> {
    let (material, quantity) = entry.split_once('=')?;
    let material = Uuid::parse_str(material.trim()).ok()?;
    let quantity = quantity.trim().parse::<Decimal>().ok()?;
    Some((material, quantity))
}

fn validate_low_stock_thresholds(value: &str) -> Result<(), ValidationError> {
    for entry in value.split(',').filter(|e| !e.trim().is_empty()) {
        match parse_threshold(entry) {
            Some((_, quantity)) if !quantity.is_sign_negative() => {}
            _ => {
                let mut err = ValidationError::new("low_stock_thresholds");
                err.message = Some(
                    "Must be a comma separated list of material_id=quantity pairs".into(),
                );
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("lot_ledger={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables prefixed with `APP__`
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

/// Loads configuration from an explicit file, still honouring `APP__*` overrides.
pub fn load_config_from(path: &Path) -> Result<AppConfig, AppConfigError> {
    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;
    Ok(app_config)
}
