//! Configuration parsing and validation
//!
//! Two layers: [`Config`] holds the command-line arguments (parsed with clap),
//! and [`ConfigFile`] is the JSON file they point at, which lists the backends
//! and the switching parameters.
use crate::backend::{BackendSpec, StartupPolicy};
use crate::switcher::SwitcherConfig;
use anyhow::{Context, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The JSON file listing the backends to manage.
    #[arg(short = 'c', long, env = "CONFIG_PATH", default_value = "config.json")]
    pub config: PathBuf,

    /// The port on which the switcher API will listen.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 9000)]
    pub port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "model_switcher")]
    pub metrics_prefix: String,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config.display()
            ));
        }
        Ok(self)
    }
}

/// Problems with an otherwise well-formed config file
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("no backends defined in config")]
    NoBackends,

    #[error("duplicate backend id: {0}")]
    DuplicateId(String),

    #[error("exactly one backend must have startup = \"active\", found {0}")]
    ActiveCount(usize),

    #[error("backend {id}: memory_gb must be a non-negative number, got {value}")]
    InvalidMemory { id: String, value: f64 },

    #[error("switching.{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// The config file: backends plus switching parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub backends: Vec<BackendSpec>,

    #[serde(default)]
    pub switching: SwitchingConfig,
}

impl ConfigFile {
    /// Load and validate the config file
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::DuplicateId(backend.id.clone()));
            }
            if !backend.memory_gb.is_finite() || backend.memory_gb < 0.0 {
                return Err(ConfigError::InvalidMemory {
                    id: backend.id.clone(),
                    value: backend.memory_gb,
                });
            }
        }

        let active = self
            .backends
            .iter()
            .filter(|b| b.startup == StartupPolicy::Active)
            .count();
        if active != 1 {
            return Err(ConfigError::ActiveCount(active));
        }

        self.switching.validate()
    }
}

/// Timing parameters, all optional in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchingConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// 450 checks at 2s allows a backend 15 minutes to come up
    #[serde(default = "default_max_health_checks")]
    pub max_health_checks: u32,

    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,

    #[serde(default = "default_resync_timeout_secs")]
    pub resync_timeout_secs: u64,

    /// Timeout for each request made to a backend
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_health_check_interval_ms() -> u64 {
    2000
}

fn default_max_health_checks() -> u32 {
    450
}

fn default_resync_interval_secs() -> u64 {
    30
}

fn default_resync_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            max_health_checks: default_max_health_checks(),
            resync_interval_secs: default_resync_interval_secs(),
            resync_timeout_secs: default_resync_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SwitchingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("health_check_interval_ms"));
        }
        if self.max_health_checks == 0 {
            return Err(ConfigError::ZeroInterval("max_health_checks"));
        }
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("resync_interval_secs"));
        }
        if self.resync_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval("resync_timeout_secs"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval("request_timeout_secs"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn switcher_config(&self) -> SwitcherConfig {
        SwitcherConfig::builder()
            .health_check_interval(Duration::from_millis(self.health_check_interval_ms))
            .max_health_checks(self.max_health_checks)
            .resync_interval(Duration::from_secs(self.resync_interval_secs))
            .resync_timeout(Duration::from_secs(self.resync_timeout_secs))
            .build()
    }
}
