//! Ingestion configuration.
//!
//! An optional TOML file supplies the base values; environment variables
//! override them. A `.env` file in the working directory fills in variables
//! the process environment does not set. All of it is read once at startup.
//! Credentials only come from the environment and are never serialized.

use minutebar_core::data::{alpaca, AlpacaCredentials, FeedTier, DEFAULT_ROW_LIMIT};
use minutebar_core::domain::normalize_symbol;
use minutebar_core::store::StoreOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_KEY_ID: &str = "ALPACA_KEY_ID";
pub const ENV_SECRET_KEY: &str = "ALPACA_SECRET_KEY";
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credentials: set {0}")]
    MissingCredentials(String),

    #[error("no symbols configured")]
    NoSymbols,

    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("cannot read config file {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("config parse error: {0}")]
    Parse(String),
}

/// Settings for the poll loop and the store it writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    #[serde(skip)]
    pub credentials: Option<AlpacaCredentials>,
    pub symbols: Vec<String>,
    pub db_path: PathBuf,
    pub poll_interval_secs: u64,
    pub feed: FeedTier,
    pub row_limit: usize,
    pub base_url: String,
    pub lock_timeout_ms: u64,
    /// Number of cycle reports kept in memory.
    pub log_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            symbols: vec!["AAPL".into(), "MSFT".into()],
            db_path: PathBuf::from("store/market.sqlite"),
            poll_interval_secs: 60,
            feed: FeedTier::Iex,
            row_limit: DEFAULT_ROW_LIMIT,
            base_url: alpaca::DEFAULT_BASE_URL.to_string(),
            lock_timeout_ms: 5_000,
            log_capacity: 200,
        }
    }
}

impl IngestConfig {
    /// Parse from a TOML string. Missing keys take their defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// File (if any), then `./.env` and process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env_file(path, Path::new(DEFAULT_ENV_FILE))
    }

    /// Like [`load`](Self::load) with an explicit dotenv file.
    ///
    /// A missing dotenv file is not an error. Process variables win over
    /// values from the file.
    pub fn load_with_env_file(path: Option<&Path>, env_file: &Path) -> Result<Self, ConfigError> {
        Self::load_layered(path, env_file, |name| std::env::var(name).ok())
    }

    fn load_layered<F>(path: Option<&Path>, env_file: &Path, process: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        let dotenv = read_env_file(env_file)?;
        config.apply_env_with(|name| process(name).or_else(|| dotenv.get(name).cloned()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Blank values count as unset.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        if let (Some(key_id), Some(secret_key)) = (var(ENV_KEY_ID), var(ENV_SECRET_KEY)) {
            self.credentials = Some(AlpacaCredentials { key_id, secret_key });
        }
        if let Some(raw) = var("SYMBOLS") {
            self.symbols = raw.split(',').map(str::to_string).collect();
        }
        if let Some(raw) = var("DB_PATH") {
            self.db_path = PathBuf::from(raw);
        }
        if let Some(raw) = var("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_number("POLL_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = var("ALPACA_FEED") {
            self.feed = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "ALPACA_FEED".into(),
                value: raw.clone(),
                reason,
            })?;
        }
        if let Some(raw) = var("ROW_LIMIT") {
            self.row_limit = parse_number("ROW_LIMIT", &raw)?;
        }
        if let Some(raw) = var("ALPACA_DATA_URL") {
            self.base_url = raw;
        }
        Ok(())
    }

    /// Normalize symbols and reject values the poll loop cannot run with.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let mut symbols: Vec<String> = Vec::with_capacity(self.symbols.len());
        for s in self.symbols.iter().map(|s| normalize_symbol(s)) {
            if !s.is_empty() && !symbols.contains(&s) {
                symbols.push(s);
            }
        }
        if symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        self.symbols = symbols;

        if self.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs", "0", "must be at least 1"));
        }
        if self.row_limit == 0 {
            return Err(invalid("row_limit", "0", "must be at least 1"));
        }
        if self.log_capacity == 0 {
            return Err(invalid("log_capacity", "0", "must be at least 1"));
        }
        Ok(())
    }

    /// Credentials, required only by commands that talk to the feed.
    pub fn require_credentials(&self) -> Result<&AlpacaCredentials, ConfigError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| ConfigError::MissingCredentials(format!("{ENV_KEY_ID} and {ENV_SECRET_KEY}")))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }
}

/// Variables from a dotenv file. An absent file yields none.
fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return Ok(HashMap::new()),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    let vars = iter
        .collect::<Result<HashMap<_, _>, _>>()
        .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), vars = vars.len(), "loaded dotenv file");
    Ok(vars)
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| invalid(key, raw, &e.to_string()))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
