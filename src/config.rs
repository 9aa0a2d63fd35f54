//! Server configuration.
//!
//! Configuration is a YAML document with four sections: forge credentials,
//! the webhook listener, the logger, and the job runner. Fields with no
//! sensible default are required; a missing required field fails startup
//! with its dotted name (camel-cased leaf), so an operator sees
//! `missing fields in config: (github.oauth)` rather than a serde backtrace.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Default webhook listener address.
const DEFAULT_ADDRESS: &str = ":3000";

/// Default number of parallel job workers.
const DEFAULT_NUM_WORKERS: usize = 4;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("failed reading configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid YAML.
    #[error("failed parsing configuration yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Required fields are absent.
    #[error("missing fields in config: ({})", .0.join(" , "))]
    MissingFields(Vec<String>),

    /// A field is present but holds an unusable value.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Forge credentials: the account the server acts as.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    pub user: Option<String>,
    pub oauth: Option<String>,
}

/// Webhook listener settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListenerConfig {
    pub address: Option<String>,
}

/// Logging level and target.
///
/// `target` is either the literal `console` or a file path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerConfig {
    pub level: Option<String>,
    pub target: Option<String>,
}

/// Job runner settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerConfig {
    #[serde(rename = "numWorkers")]
    pub num_workers: Option<usize>,
    #[serde(rename = "authorizedUsers")]
    pub authorized_users: Option<Vec<String>>,
}

/// Raw deserialized configuration, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    github: Option<GithubConfig>,
    #[serde(default)]
    listener: ListenerConfig,
    #[serde(default)]
    logger: LoggerConfig,
    #[serde(default)]
    runner: RunnerConfig,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Forge account login used for paste URLs.
    pub user: String,

    /// OAuth token sent on every forge request.
    pub oauth: String,

    /// Webhook listener address, e.g. `:3000` or `127.0.0.1:3000`.
    pub address: String,

    /// Log level: DEBUG, INFO, WARN or ERROR.
    pub log_level: String,

    /// Log target: `console` or a file path.
    pub log_target: String,

    /// Maximum number of jobs running in parallel.
    pub num_workers: usize,

    /// Users permitted to trigger jobs via `/runtest` comments.
    pub authorized_users: Vec<String>,
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses and validates configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();

        let github = raw.github.unwrap_or(GithubConfig {
            user: None,
            oauth: None,
        });
        let user = require(github.user, "github.user", &mut missing);
        let oauth = require(github.oauth, "github.oauth", &mut missing);
        let authorized_users = require(
            raw.runner.authorized_users,
            "runner.authorizedUsers",
            &mut missing,
        );

        if !missing.is_empty() {
            return Err(ConfigError::MissingFields(missing));
        }

        let log_level = raw.logger.level.unwrap_or_else(|| "INFO".to_string());
        match log_level.as_str() {
            "DEBUG" | "INFO" | "WARN" | "ERROR" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "logger.level".to_string(),
                    reason: format!("unknown level {other:?}"),
                });
            }
        }

        let num_workers = raw.runner.num_workers.unwrap_or(DEFAULT_NUM_WORKERS);
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "runner.numWorkers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Config {
            user: user.unwrap_or_default(),
            oauth: oauth.unwrap_or_default(),
            address: raw
                .listener
                .address
                .unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
            log_level,
            log_target: raw.logger.target.unwrap_or_else(|| "console".to_string()),
            num_workers,
            authorized_users: authorized_users.unwrap_or_default(),
        })
    }

    /// Returns the listener address in a form `TcpListener` can bind.
    ///
    /// A bare `:port` (the conventional form in config files) binds all
    /// interfaces.
    pub fn bind_address(&self) -> String {
        if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        }
    }
}

/// Records the dotted field name when a required value is absent.
fn require<T>(value: Option<T>, name: &str, missing: &mut Vec<String>) -> Option<T> {
    if value.is_none() {
        missing.push(name.to_string());
    }
    value
}
