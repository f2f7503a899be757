use std::path::PathBuf;
use std::str::FromStr;

use crate::db_utils::{PageLimits, DEFAULT_DB_NAME};

const DEFAULT_LOG_CONFIG: &str = "log4rs.yml";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    Missing(&'static str),
    #[error("Can't parse {key}=\"{value}\"")]
    Invalid { key: &'static str, value: String },
    #[error("Page limits out of order: default {default} exceeds max {max}")]
    PageLimits { default: u32, max: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mongodb_uri: String,
    pub db_name: String,
    pub min_pool_size: Option<u32>,
    pub max_pool_size: Option<u32>,
    pub page_limits: PageLimits,
    pub log_config: PathBuf,
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}

impl Config {
    /// Reads the process environment. Call `dotenv` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mongodb_uri = lookup("MONGODB_URI").ok_or(ConfigError::Missing("MONGODB_URI"))?;

        let defaults = PageLimits::default();
        let page_limits = PageLimits {
            default: parsed(&lookup, "CHAT_PAGE_DEFAULT_LIMIT")?.unwrap_or(defaults.default),
            max: parsed(&lookup, "CHAT_PAGE_MAX_LIMIT")?.unwrap_or(defaults.max),
        };
        if page_limits.default > page_limits.max {
            return Err(ConfigError::PageLimits {
                default: page_limits.default,
                max: page_limits.max,
            });
        }

        Ok(Self {
            mongodb_uri,
            db_name: lookup("CHAT_DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
            min_pool_size: parsed(&lookup, "MONGODB_POOL_MIN_CONNECTIONS")?,
            max_pool_size: parsed(&lookup, "MONGODB_POOL_MAX_CONNECTIONS")?,
            page_limits,
            log_config: lookup("LOG_CONFIG")
                .unwrap_or_else(|| DEFAULT_LOG_CONFIG.to_string())
                .into(),
        })
    }
}
