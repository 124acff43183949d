use std::path::{Path, PathBuf};
use std::str::FromStr;

use backops_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

pub const ENV_DATABASE_PATH: &str = "BACKOPS_DATABASE_PATH";
pub const ENV_MAX_CONNECTIONS: &str = "BACKOPS_DB_MAX_CONNECTIONS";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "BACKOPS_DB_ACQUIRE_TIMEOUT_MS";
pub const ENV_BUSY_TIMEOUT_MS: &str = "BACKOPS_DB_BUSY_TIMEOUT_MS";
pub const ENV_LOG_FORMAT: &str = "BACKOPS_LOG_FORMAT";
pub const ENV_LOG_FILTER: &str = "BACKOPS_LOG";

/// Builds an `AppConfig` from an optional config file plus environment overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from `path` (if any), then apply `BACKOPS_*` overrides from
    /// the process environment.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => AppConfig::default(),
        };
        Self::apply_env(config, |key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<AppConfig> {
        debug!("reading config from {}", path.display());
        let contents = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("config loaded from {}", path.display());
        Ok(config)
    }

    /// Apply environment overrides using `lookup` as the variable source.
    pub fn apply_env<F>(mut config: AppConfig, lookup: F) -> Result<AppConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DATABASE_PATH) {
            config.database.path = PathBuf::from(path);
        }
        if let Some(v) = lookup(ENV_MAX_CONNECTIONS) {
            config.database.max_connections = parse_var(ENV_MAX_CONNECTIONS, &v)?;
        }
        if let Some(v) = lookup(ENV_ACQUIRE_TIMEOUT_MS) {
            config.database.acquire_timeout_ms = parse_var(ENV_ACQUIRE_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_BUSY_TIMEOUT_MS) {
            config.database.busy_timeout_ms = parse_var(ENV_BUSY_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_LOG_FORMAT) {
            config.log.format = v.parse().map_err(Error::Config)?;
        }
        if let Some(v) = lookup(ENV_LOG_FILTER) {
            config.log.filter = v;
        }

        debug!(
            "effective database config: path={}, max_connections={}",
            config.database.path.display(),
            config.database.max_connections
        );
        Ok(config)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid value for {key} ({value:?}): {e}")))
}
