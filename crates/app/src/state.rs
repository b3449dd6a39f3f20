use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use common::migrate::{DomainMapping, Workspace};
use common::retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use common::store::{DriveConfig, DriveStore};
use serde::{Deserialize, Serialize};
use url::Url;

pub const APP_NAME: &str = "ferry";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STAGING_DIR_NAME: &str = "staging";
pub const LEDGER_DIR_NAME: &str = "ledger";
pub const LOGS_DIR_NAME: &str = "logs";

/// Where a store lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    Drive {
        /// Account the token belongs to; keys staging and ledger files
        principal: String,
        /// Environment variable holding an already issued bearer token
        token_env: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_url: Option<Url>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upload_url: Option<Url>,
    },
}

impl StoreConfig {
    pub fn drive(principal: impl Into<String>, token_env: impl Into<String>) -> Self {
        StoreConfig::Drive {
            principal: principal.into(),
            token_env: token_env.into(),
            api_url: None,
            upload_url: None,
        }
    }

    pub fn principal(&self) -> &str {
        match self {
            StoreConfig::Drive { principal, .. } => principal,
        }
    }

    /// Build a client, reading the token from the environment.
    pub fn connect(&self) -> anyhow::Result<DriveStore> {
        match self {
            StoreConfig::Drive {
                principal,
                token_env,
                api_url,
                upload_url,
            } => {
                let token = std::env::var(token_env).with_context(|| {
                    format!("no token for {} in ${}", principal, token_env)
                })?;
                let mut config = DriveConfig::new(token).context("invalid default API url")?;
                if let Some(url) = api_url {
                    config = config.with_api_base(url.clone());
                }
                if let Some(url) = upload_url {
                    config = config.with_upload_base(url.clone());
                }
                DriveStore::new(config)
                    .with_context(|| format!("failed to build client for {}", principal))
            }
        }
    }
}

/// Retry knobs as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub source: StoreConfig,
    pub destination: StoreConfig,
    /// Rewrite permissions from one domain to another; permissions are not
    /// copied when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<DomainMapping>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Keep the archive and extracted tree after a clean run
    #[serde(default)]
    pub keep_staging: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the state directory (~/.ferry)
    pub state_dir: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,
    /// Path to the rolling log files
    pub logs_dir: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the state directory path (custom or default ~/.ferry)
    pub fn state_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Initialize a new state directory
    pub fn init(custom_path: Option<PathBuf>, config: AppConfig) -> Result<Self, StateError> {
        let state_dir = Self::state_dir(custom_path)?;

        let config_path = state_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Err(StateError::AlreadyInitialized);
        }

        for dir in [STAGING_DIR_NAME, LEDGER_DIR_NAME, LOGS_DIR_NAME] {
            fs::create_dir_all(state_dir.join(dir))?;
        }

        let config_toml = toml::to_string_pretty(&config)?;
        fs::write(&config_path, config_toml)?;

        Ok(Self {
            logs_dir: state_dir.join(LOGS_DIR_NAME),
            state_dir,
            config_path,
            config,
        })
    }

    /// Load existing state from the state directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let state_dir = Self::state_dir(custom_path)?;

        if !state_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_path = state_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }

        let config_toml = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;

        Ok(Self {
            logs_dir: state_dir.join(LOGS_DIR_NAME),
            state_dir,
            config_path,
            config,
        })
    }

    /// Staging and ledger layout for migration runs
    pub fn workspace(&self) -> Workspace {
        Workspace::new(&self.state_dir)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("ferry directory not initialized. Run 'ferry init' first")]
    NotInitialized,

    #[error("ferry directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
