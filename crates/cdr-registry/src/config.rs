//! Registry configuration

use crate::error::{RegistryError, Result};
use cdr_types::DeploymentMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration consumed once at registry start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Deployment mode of this node. Required.
    #[serde(default)]
    pub mode: Option<DeploymentMode>,

    /// Resolve and fetch resources from remote nodes
    #[serde(default = "default_true")]
    pub peer_loading_enabled: bool,

    /// Fetch timeout in milliseconds; must be positive when peer loading is on
    #[serde(default = "default_network_timeout")]
    pub network_timeout_ms: u64,

    /// Resource name patterns never reused from the local store.
    /// `foo.Bar` matches by prefix, `foo.*` matches anything under `foo.`
    #[serde(default)]
    pub local_exclusions: Vec<String>,

    /// With peer loading disabled, serve everything from one immortal unit
    #[serde(default)]
    pub static_deployment: bool,

    /// Evict unreferenced per-context and per-version units idle this long.
    /// `None` disables eviction.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: Option<u64>,

    /// Interval of the idle sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mode: None,
            peer_loading_enabled: true,
            network_timeout_ms: default_network_timeout(),
            local_exclusions: Vec::new(),
            static_deployment: false,
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_network_timeout() -> u64 {
    5_000
}

fn default_idle_timeout() -> Option<u64> {
    Some(600)
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RegistryConfig {
    /// Configuration for a node in `mode`, all else default
    pub fn for_mode(mode: DeploymentMode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    /// Load configuration from defaults, an optional file and `CDR_`
    /// environment variables (`CDR_NETWORK_TIMEOUT_MS`, `CDR_LOGGING__LEVEL`)
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&RegistryConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Add environment variables with CDR_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("CDR")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("local_exclusions")
                .try_parsing(true),
        );

        let config: RegistryConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings the registry cannot start without
    pub fn validate(&self) -> Result<DeploymentMode> {
        let mode = self
            .mode
            .ok_or_else(|| RegistryError::Configuration("deployment mode is required".into()))?;

        if self.peer_loading_enabled && self.network_timeout_ms == 0 {
            return Err(RegistryError::Configuration(
                "network timeout must be positive when peer loading is enabled".into(),
            ));
        }
        if self.idle_timeout_secs.is_some() && self.sweep_interval_secs == 0 {
            return Err(RegistryError::Configuration(
                "sweep interval must be positive when idle eviction is enabled".into(),
            ));
        }
        if let Some(pattern) = self.local_exclusions.iter().find(|p| p.trim().is_empty()) {
            return Err(RegistryError::Configuration(format!(
                "empty local exclusion pattern: {:?}",
                pattern
            )));
        }
        Ok(mode)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Runs a single immortal unit instead of the stores
    pub fn uses_immortal_unit(&self) -> bool {
        !self.peer_loading_enabled && self.static_deployment
    }
}
