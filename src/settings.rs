//! Configuration surface (spec §6.7, ambient stack §10.3).
//!
//! The XML loader that produces these values in the original is an external
//! collaborator (spec §6.7, §9 "libxml2-driven XML loading... entirely an
//! external collaborator") — this crate never parses XML. These structs only
//! give a host application, or a test, a concrete `serde::Deserialize` shape
//! to hand already-parsed settings through, following the teacher's
//! `utils.rs::Settings` pattern (`config` crate merging a file over env vars).

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::intermediate::anonymization::AnonymizationType;

/// Windowing and storage-path policy shared by storage stages.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(with = "humantime_seconds")]
    pub interval: Duration,
    pub align: bool,
    pub base_dir: Option<PathBuf>,
}

fn default_anon_type() -> String {
    "truncation".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnonymizationConfig {
    #[serde(default = "default_anon_type")]
    pub r#type: String,
    #[serde(default)]
    pub key: String,
}

impl AnonymizationConfig {
    /// Resolves the configured type string into the stage's own enum,
    /// rejecting anything else rather than silently defaulting (an
    /// unrecognized value is a configuration error, not a runtime one).
    pub fn anonymization_type(&self) -> Result<AnonymizationType, ConfigError> {
        match self.r#type.as_str() {
            "truncation" => Ok(AnonymizationType::Truncation),
            "cryptopan" => Ok(AnonymizationType::CryptoPan),
            other => Err(ConfigError::Message(format!("unknown anonymization type '{}'", other))),
        }
    }
}

/// UDP-source template refresh policy (spec §6.7, exercised by
/// `template::Template::{packets_since_refresh,last_refresh_unix_millis}`).
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SourceLifetimeConfig {
    pub template_life_time: Option<u64>,
    pub options_template_life_time: Option<u64>,
    pub template_life_packet: Option<u32>,
    pub options_template_life_packet: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enable: bool,
    pub host: String,
}

/// Top-level settings a host application assembles and feeds to the
/// pipeline/plugins it builds; mirrors the teacher's `Settings` struct,
/// extended with every item spec §6.7 enumerates.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub log: LogConfig,
    pub listener: ListenerConfig,
    pub metrics: MetricsConfig,
    pub pipeline: PipelineConfig,
    pub anonymization: AnonymizationConfig,
    pub source_lifetime: SourceLifetimeConfig,
}

impl Settings {
    /// Loads settings from an optional config file, overridden by `APP_*`
    /// environment variables, same precedence as the teacher's `utils.rs`.
    pub fn init(config_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = Config::new();
        if let Some(path) = config_file {
            s.merge(File::from(path))?;
        } else {
            log::info!("no config file provided, using defaults overridden by APP_* env vars only");
        }
        s.merge(Environment::with_prefix("APP").separator("_"))?;
        s.try_into()
    }
}

mod humantime_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymization_type_rejects_unknown_value() {
        let cfg = AnonymizationConfig { r#type: "rot13".to_string(), key: String::new() };
        assert!(cfg.anonymization_type().is_err());
    }

    #[test]
    fn anonymization_type_resolves_known_values() {
        let truncation = AnonymizationConfig { r#type: "truncation".to_string(), key: String::new() };
        assert_eq!(truncation.anonymization_type().unwrap(), AnonymizationType::Truncation);

        let cryptopan = AnonymizationConfig { r#type: "cryptopan".to_string(), key: "k".to_string() };
        assert_eq!(cryptopan.anonymization_type().unwrap(), AnonymizationType::CryptoPan);
    }
}
