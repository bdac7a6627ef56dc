//! Engine configuration.
//!
//! Defaults live in code. [`EngineConfig::load`] layers an optional TOML file
//! and then `PAYMASTER__*` environment variables on top of them, e.g.
//! `PAYMASTER__MAX_REPLENISHMENT_PERIODS=12`.

use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};
use paymaster_core::constants::{DEFAULT_DEBT_CAPACITY, DEFAULT_MAX_REPLENISHMENT_PERIODS, DEFAULT_VERSION};
use paymaster_core::period::Period;
use serde::{Deserialize, Serialize};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "PAYMASTER";

/// Tunables of a [`SettlementEngine`](crate::SettlementEngine).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// How far past the current period a source may be funded.
    pub max_replenishment_periods: u32,
    /// Period calendar for payments and claims.
    pub period: Period,
    /// Capacity of the debt ring buffer.
    pub debt_capacity: usize,
    /// Version string reported by the engine.
    pub version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_replenishment_periods: DEFAULT_MAX_REPLENISHMENT_PERIODS,
            period: Period::CalendarMonth,
            debt_capacity: DEFAULT_DEBT_CAPACITY,
            version: DEFAULT_VERSION.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path` if it exists, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX).separator("__"))
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let cfg: Self = builder
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_replenishment_periods == 0 {
            return Err(ConfigError::Message(
                "max_replenishment_periods must be positive".to_string(),
            ));
        }
        if self.debt_capacity == 0 {
            return Err(ConfigError::Message("debt_capacity must be positive".to_string()));
        }
        if self.period == (Period::Fixed { seconds: 0 }) {
            return Err(ConfigError::Message("fixed period must be at least one second".to_string()));
        }
        Ok(())
    }
}
