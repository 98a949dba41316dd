use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEV_PAYMENT_SECRET: &str = "development-only-payment-secret";
const DEV_DEFAULT_OTP_SECRET: &str = "development-only-otp-secret-change-me-before-deploying";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Per-request timeout applied by the HTTP layer
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Number of digits in a delivery OTP
    #[serde(default = "default_otp_length")]
    #[validate(range(min = 4, max = 8))]
    pub otp_length: u32,

    /// Validity of an issued OTP in seconds
    #[serde(default = "default_otp_ttl_secs")]
    #[validate(range(min = 30))]
    pub otp_ttl_secs: u64,

    /// Failed verifications allowed per issued code
    #[serde(default = "default_otp_max_attempts")]
    #[validate(range(min = 1))]
    pub otp_max_attempts: u32,

    /// HMAC key used to hash delivery OTPs at rest
    #[serde(default = "default_otp_secret")]
    #[validate(length(min = 32))]
    pub otp_secret: String,

    /// Flat delivery charge below the free-delivery threshold
    #[serde(default = "default_delivery_base_charge")]
    pub delivery_base_charge: Decimal,

    /// Subtotal at or above which standard delivery is free
    #[serde(default = "default_free_delivery_threshold")]
    pub free_delivery_threshold: Decimal,

    /// Comma-separated postal code prefixes that attract a surcharge
    #[serde(default)]
    pub remote_postal_prefixes: Option<String>,

    /// Surcharge for remote postal codes, applied even to free deliveries
    #[serde(default)]
    pub remote_delivery_surcharge: Decimal,

    /// Secret shared with the payment gateway for signature verification
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Window during which a repeated guest-cart snapshot is treated as a replay
    #[serde(default = "default_cart_merge_replay_window_secs")]
    pub cart_merge_replay_window_secs: u64,
}

impl AppConfig {
    /// Creates a configuration populated with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            request_timeout_secs: default_request_timeout_secs(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            otp_length: default_otp_length(),
            otp_ttl_secs: default_otp_ttl_secs(),
            otp_max_attempts: default_otp_max_attempts(),
            otp_secret: default_otp_secret(),
            delivery_base_charge: default_delivery_base_charge(),
            free_delivery_threshold: default_free_delivery_threshold(),
            remote_postal_prefixes: None,
            remote_delivery_surcharge: Decimal::ZERO,
            payment_webhook_secret: None,
            cart_merge_replay_window_secs: default_cart_merge_replay_window_secs(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
            || self.environment.eq_ignore_ascii_case("test")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Key shared with the payment gateway; development falls back to a bundled key
    pub fn payment_signing_secret(&self) -> &str {
        self.payment_webhook_secret
            .as_deref()
            .unwrap_or(DEV_PAYMENT_SECRET)
    }

    /// Remote postal prefixes as a trimmed list
    pub fn remote_prefixes(&self) -> Vec<String> {
        self.remote_postal_prefixes
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.otp_secret == DEV_DEFAULT_OTP_SECRET {
            let mut err = ValidationError::new("otp_secret_default_dev");
            err.message = Some(
                "The bundled development OTP secret must not be used outside development. Set APP__OTP_SECRET."
                    .into(),
            );
            errors.add("otp_secret", err);
        }

        if !self.is_development() && self.payment_webhook_secret.is_none() {
            let mut err = ValidationError::new("payment_webhook_secret_missing");
            err.message = Some(
                "A payment gateway signing secret is required outside development. Set APP__PAYMENT_WEBHOOK_SECRET."
                    .into(),
            );
            errors.add("payment_webhook_secret", err);
        }

        if self.delivery_base_charge.is_sign_negative()
            || self.free_delivery_threshold.is_sign_negative()
            || self.remote_delivery_surcharge.is_sign_negative()
        {
            let mut err = ValidationError::new("delivery_pricing_negative");
            err.message = Some("Delivery charges and thresholds must not be negative".into());
            errors.add("delivery_base_charge", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
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
    1024
}

fn default_otp_length() -> u32 {
    4
}

fn default_otp_ttl_secs() -> u64 {
    600
}

fn default_otp_max_attempts() -> u32 {
    5
}

fn default_otp_secret() -> String {
    DEV_DEFAULT_OTP_SECRET.to_string()
}

fn default_delivery_base_charge() -> Decimal {
    Decimal::from(40)
}

fn default_free_delivery_threshold() -> Decimal {
    Decimal::from(500)
}

fn default_cart_merge_replay_window_secs() -> u64 {
    86_400
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

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("fulfillment_api={},tower_http=debug", level);
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
/// 4. Environment variables (APP__*)
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
        .set_default("database_url", "sqlite://fulfillment.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
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

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
