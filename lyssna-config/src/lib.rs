//! # lyssna configuration
//!
//! Layered configuration for the capture-source management core.
//!
//! Hierarchy, later layers overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/lyssna.yaml`
//! 3. `LYSSNA_*` environment variables (`__` separates nesting)
//!
//! Every section validates after extraction; timing knobs (probe deadline,
//! retry cadence, worker kill grace) and buffer caps are range-checked so a
//! bad deployment fails at startup rather than at 3am.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod capture;
mod core;
mod error;
mod telemetry;
mod validation;

pub use capture::{CaptureConfig, EndpointBufferConfig};
pub use core::{CoreConfig, EventBusConfig};
pub use error::ConfigError;
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/lyssna.yaml";
const ENV_PREFIX: &str = "LYSSNA_";

/// Top-level configuration container.
#[derive(Debug, Default, Serialize, Deserialize, Validate, Clone)]
pub struct LyssnaConfig {
    /// Event bus and timer parameters.
    #[validate(nested)]
    #[serde(default)]
    pub core: CoreConfig,

    /// Capture-source management parameters.
    #[validate(nested)]
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Logging and metrics parameters.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl LyssnaConfig {
    /// Load from the default file and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(LyssnaConfig::default()));
        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load from a specific path, still honoring environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        Self::extract(
            Figment::from(Serialized::defaults(LyssnaConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}
