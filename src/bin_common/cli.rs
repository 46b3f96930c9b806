//! Minimal environment-driven CLI options.

use anyhow::Result;
use crossarb::Settings;

#[derive(Debug, Clone)]
pub struct CliOptions {
    pub log_level: String,
    pub settings: Settings,
}

impl CliOptions {
    /// Read `.env`, the optional `ARBOT_CONFIG` YAML file, and env
    /// overrides. `ARBOT_LOG` picks the level (default `info`).
    pub fn from_env() -> Result<Self> {
        let settings = Settings::load()?;
        let log_level = std::env::var("ARBOT_LOG").unwrap_or_else(|_| "info".to_string());
        Ok(Self {
            log_level,
            settings,
        })
    }
}
