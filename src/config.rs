//! Configuration management for Quotagate.
//!
//! Sources, later ones winning: built-in defaults, an optional YAML file,
//! then `QUOTAGATE__*` environment variables (`__` separates nesting, e.g.
//! `QUOTAGATE__BACKEND__REDIS_URL`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{QuotaError, Result};
use crate::ratelimit::{sweep_interval, Backend, DistributedConfig, Tier, TierRegistry, TierSpec};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the Quotagate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Window store backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Tier overrides on top of the built-in table
    #[serde(default)]
    pub tiers: HashMap<Tier, TierSpec>,

    /// Local store maintenance
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Distributed backend settings. Without a URL only the local store is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Redis URL
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Redis access token
    #[serde(default)]
    pub redis_token: Option<String>,

    /// Prefix for all keys written to Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_token: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "quotagate".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

impl BackendConfig {
    /// Resolve the backend. A blank URL counts as absent.
    pub fn backend(&self) -> Backend {
        match self.redis_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Backend::Distributed(DistributedConfig {
                url: url.to_string(),
                token: self.redis_token.clone().filter(|token| !token.is_empty()),
                key_prefix: self.key_prefix.clone(),
                timeout: Duration::from_millis(self.timeout_ms.max(1)),
            }),
            _ => Backend::Local,
        }
    }
}

/// Sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Upper bound on the sweep interval in seconds
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            max_interval_secs: default_max_interval(),
        }
    }
}

fn default_max_interval() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl QuotaConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: QuotaConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a file path, without the environment overlay.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Build and validate the tier registry.
    pub fn registry(&self) -> Result<TierRegistry> {
        TierRegistry::from_specs(&self.tiers)
    }

    /// The window store backend selected by this configuration.
    pub fn backend(&self) -> Backend {
        self.backend.backend()
    }

    /// Sweep interval for `registry` under this configuration's cap.
    pub fn sweep_interval(&self, registry: &TierRegistry) -> Duration {
        sweep_interval(
            registry.smallest_window(),
            Duration::from_secs(self.sweeper.max_interval_secs),
        )
    }
}
