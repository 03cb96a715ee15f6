use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RefitError, Result};

/// Refit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RefitConfig {
    /// Registry protocol settings
    pub registry: RegistryConfig,

    /// Container engine connection
    pub engine: EngineConfig,

    /// Recreate orchestration
    pub recreate: RecreateConfig,

    /// Event publishing
    pub events: EventConfig,

    /// Log level
    pub log_level: LogLevel,
}

impl RefitConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RefitError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config location (`~/.refit/config.yaml`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".refit"))
            .unwrap_or_else(|| PathBuf::from(".refit"))
            .join("config.yaml")
    }

    /// Load from `path` if given, else from the default location if it
    /// exists, else fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_yaml_file(p),
            None => {
                let default = Self::default_path();
                if default.is_file() {
                    Self::from_yaml_file(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Reject settings that would make calls unbounded or drop every event.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("registry.request_timeout_secs", self.registry.request_timeout_secs),
            ("registry.architecture_timeout_secs", self.registry.architecture_timeout_secs),
            ("engine.call_timeout_secs", self.engine.call_timeout_secs),
            ("engine.pull_timeout_secs", self.engine.pull_timeout_secs),
            ("recreate.compensation_grace_secs", self.recreate.compensation_grace_secs),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(RefitError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.events.queue_capacity == 0 {
            return Err(RefitError::Config(
                "events.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.registry.fallback_architecture.trim().is_empty() {
            return Err(RefitError::Config(
                "registry.fallback_architecture must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-request timeout for challenge, token and manifest calls
    pub request_timeout_secs: u64,

    /// Bound on a whole architecture lookup
    pub architecture_timeout_secs: u64,

    /// How long architecture lists stay cached
    pub architecture_cache_ttl_secs: u64,

    /// Returned when architectures cannot be determined
    pub fallback_architecture: String,

    /// Registry hosts reached over plain HTTP
    pub plain_http: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 5,
            architecture_timeout_secs: 5,
            architecture_cache_ttl_secs: 6 * 60 * 60,
            fallback_architecture: "amd64".to_string(),
            plain_http: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn architecture_timeout(&self) -> Duration {
        Duration::from_secs(self.architecture_timeout_secs)
    }

    pub fn architecture_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.architecture_cache_ttl_secs)
    }
}

/// Container engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine API unix socket
    pub socket_path: PathBuf,

    /// Bound on any single engine call
    pub call_timeout_secs: u64,

    /// Grace period handed to the engine when stopping a container
    pub stop_timeout_secs: u64,

    /// Bound on an image pull, which streams layers and outlasts other calls
    pub pull_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            call_timeout_secs: 30,
            stop_timeout_secs: 10,
            pull_timeout_secs: 600,
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

/// Recreate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecreateConfig {
    /// Time allowed for each compensating action, even past the deadline
    pub compensation_grace_secs: u64,

    /// Overall deadline for a recreate (unbounded when unset)
    pub deadline_secs: Option<u64>,
}

impl Default for RecreateConfig {
    fn default() -> Self {
        Self {
            compensation_grace_secs: 15,
            deadline_secs: None,
        }
    }
}

impl RecreateConfig {
    pub fn compensation_grace(&self) -> Duration {
        Duration::from_secs(self.compensation_grace_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Event configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Events buffered before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}
