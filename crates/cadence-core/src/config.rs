use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CoreError;
use crate::recurrence::{ExpansionLimits, MAX_OCCURRENCES};
use crate::timezone::validate_timezone;

pub const CONFIG_FILE: &str = "cadence.toml";
pub const ENV_PREFIX: &str = "CADENCE_";

/// Engine settings. Every field has a default; `cadence.toml` and `CADENCE_*`
/// environment variables override them, in that order.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// SQLite file path or `sqlite:` URL
    pub database_url: String,
    /// Per-series cap on instances returned by one expansion (at most 1000)
    pub max_occurrences: usize,
    /// IANA timezone used to group agenda days
    pub default_timezone: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://cadence.db".to_string(),
            max_occurrences: MAX_OCCURRENCES,
            default_timezone: "UTC".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Result<Self, CoreError> {
        Self::load_from(CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(EngineConfig::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Extracts and validates a config; an oversized `max_occurrences` is
    /// clamped to the hard ceiling.
    pub fn from_figment(figment: Figment) -> Result<Self, CoreError> {
        let mut config: EngineConfig = figment.extract()?;
        validate_timezone(&config.default_timezone)?;
        config.max_occurrences = config.expansion_limits().max_occurrences;
        Ok(config)
    }

    pub fn expansion_limits(&self) -> ExpansionLimits {
        ExpansionLimits::new(self.max_occurrences)
    }
}
