use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::collections::HashMap;
use std::env as std_env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::db::{BackendKind, BackendSettings};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CACHE_TTL_SECS: u64 = 60;

const REQUIRED: [&str; 4] = ["db_uri", "db_provider", "storage_provider", "storage_bucket"];
const REQUIRED_FOR_KEY_VALUE: [&str; 3] = ["aws_region", "aws_access_key_id", "aws_secret_access_key"];

/// Process configuration, read once from the environment at startup.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URI (`sqlite::memory:`, `postgres://...`, `memory:` for in-process clients)
    pub db_uri: String,

    /// Backend family: documentstore, keyvalue or otherdoc
    #[validate(custom = "validate_db_provider")]
    pub db_provider: String,

    /// Object storage provider: local or memory
    #[validate(custom = "validate_storage_provider")]
    pub storage_provider: String,

    /// Bucket name; the local provider uses it as its root directory
    #[validate(length(min = 1))]
    pub storage_bucket: String,

    /// Application environment
    #[serde(default = "default_env")]
    pub node_env: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Disable authentication in front of the handlers
    #[serde(default)]
    pub skip_auth: bool,

    /// Log transaction begin/commit/rollback at info level
    #[serde(default)]
    pub enable_transaction_logging: bool,

    #[serde(default)]
    pub aws_region: Option<String>,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// TTL of repository read caches
    #[serde(default = "default_cache_ttl_secs")]
    #[validate(range(min = 1))]
    pub cache_ttl_secs: u64,
}

impl AppConfig {
    pub fn backend_kind(&self) -> Result<BackendKind, AppConfigError> {
        BackendKind::from_str(&self.db_provider)
            .map_err(|_| AppConfigError::Invalid(format!("unknown DB_PROVIDER '{}'", self.db_provider)))
    }

    /// Connection settings for the configured backend.
    pub fn database_settings(&self) -> Result<BackendSettings, AppConfigError> {
        let mut settings = BackendSettings::new(self.backend_kind()?, self.db_uri.clone());
        settings.region = self.aws_region.clone();
        Ok(settings)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn is_production(&self) -> bool {
        self.node_env.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.node_env.eq_ignore_ascii_case("development")
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_env() -> String {
    DEFAULT_ENV.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn validate_db_provider(value: &str) -> Result<(), ValidationError> {
    if BackendKind::from_str(value).is_ok() {
        Ok(())
    } else {
        let mut err = ValidationError::new("db_provider");
        err.message = Some("Must be one of: documentstore, keyvalue, otherdoc".into());
        Err(err)
    }
}

fn validate_storage_provider(value: &str) -> Result<(), ValidationError> {
    match value {
        "local" | "memory" => Ok(()),
        _ => {
            let mut err = ValidationError::new("storage_provider");
            err.message = Some("Must be one of: local, memory".into());
            Err(err)
        }
    }
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

    let default_directive = format!("ledgerlink_core={},tower_http=debug", level);
    let filter_directive = std_env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads configuration from the process environment.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(None)
}

/// Loads configuration from `source` instead of the process environment when
/// given. Variable names are the fixed upper-case names (`DB_URI`, ...).
pub fn load_config_from(source: Option<HashMap<String, String>>) -> Result<AppConfig, AppConfigError> {
    let config = Config::builder()
        .set_default("node_env", DEFAULT_ENV)?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("skip_auth", false)?
        .set_default("enable_transaction_logging", false)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("cache_ttl_secs", DEFAULT_CACHE_TTL_SECS as i64)?
        .add_source(Environment::default().try_parsing(true).source(source))
        .build()?;

    let present = |name: &str| {
        config
            .get_string(name)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    };
    let mut missing: Vec<String> = REQUIRED
        .iter()
        .filter(|name| !present(name))
        .map(|name| name.to_uppercase())
        .collect();
    if config.get_string("db_provider").ok().as_deref() == Some("keyvalue") {
        missing.extend(
            REQUIRED_FOR_KEY_VALUE
                .iter()
                .filter(|name| !present(name))
                .map(|name| name.to_uppercase()),
        );
    }
    if !missing.is_empty() {
        error!(missing = ?missing, "Required configuration is missing");
        return Err(AppConfigError::Missing(missing));
    }

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!(
        provider = %app_config.db_provider,
        environment = %app_config.node_env,
        "Configuration loaded successfully"
    );
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DB_URI", "sqlite::memory:"),
            ("DB_PROVIDER", "documentstore"),
            ("STORAGE_PROVIDER", "memory"),
            ("STORAGE_BUCKET", "uploads"),
        ]
    }

    #[test]
    fn defaults_fill_optional_settings() {
        let config = load_config_from(Some(vars(&base()))).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.node_env, "development");
        assert!(!config.skip_auth);
        assert!(!config.enable_transaction_logging);
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.backend_kind().unwrap(), BackendKind::DocumentStore);
    }

    #[test]
    fn every_missing_variable_is_listed() {
        let err = load_config_from(Some(vars(&[("DB_URI", "sqlite::memory:")]))).unwrap_err();
        match err {
            AppConfigError::Missing(names) => {
                assert_eq!(names, vec!["DB_PROVIDER", "STORAGE_PROVIDER", "STORAGE_BUCKET"])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn key_value_provider_requires_credentials() {
        let mut pairs = base();
        pairs[1] = ("DB_PROVIDER", "keyvalue");
        pairs.push(("AWS_REGION", "us-east-1"));
        let err = load_config_from(Some(vars(&pairs))).unwrap_err();
        assert!(
            matches!(err, AppConfigError::Missing(ref names) if names == &vec!["AWS_ACCESS_KEY_ID".to_string(), "AWS_SECRET_ACCESS_KEY".to_string()])
        );
    }

    #[test]
    fn unknown_provider_fails_validation() {
        let mut pairs = base();
        pairs[1] = ("DB_PROVIDER", "mongodb");
        let err = load_config_from(Some(vars(&pairs))).unwrap_err();
        assert!(matches!(err, AppConfigError::Validation(_)));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = base();
        pairs.push(("PORT", "8088"));
        pairs.push(("ENABLE_TRANSACTION_LOGGING", "true"));
        pairs.push(("CACHE_TTL_SECS", "5"));
        let config = load_config_from(Some(vars(&pairs))).unwrap();
        assert_eq!(config.port, 8088);
        assert!(config.enable_transaction_logging);
        assert_eq!(config.cache_ttl_secs, 5);
    }
}
