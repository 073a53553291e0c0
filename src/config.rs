use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::convergence::converger::{
    DEFAULT_CONVERGENCE_INTERVAL_SECS, DEFAULT_TICK_PERIOD_SECS, DEFAULT_TIME_TO_CLAIM_SECS,
};
use crate::convergence::ConvergerConfig;
use crate::{clog_debug, Error, Result};

fn default_tick_period_secs() -> u64 {
    DEFAULT_TICK_PERIOD_SECS
}

fn default_time_to_claim_secs() -> u64 {
    DEFAULT_TIME_TO_CLAIM_SECS
}

fn default_convergence_interval_secs() -> u64 {
    DEFAULT_CONVERGENCE_INTERVAL_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between sweeps.
    #[serde(default = "default_tick_period_secs")]
    pub tick_period_secs: u64,
    /// Seconds a task may stay pending before it is failed.
    #[serde(default = "default_time_to_claim_secs")]
    pub time_to_claim_secs: u64,
    /// Seconds of quiet before a task is kicked or demoted.
    #[serde(default = "default_convergence_interval_secs")]
    pub convergence_interval_secs: u64,
    pub log_file: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_period_secs: DEFAULT_TICK_PERIOD_SECS,
            time_to_claim_secs: DEFAULT_TIME_TO_CLAIM_SECS,
            convergence_interval_secs: DEFAULT_CONVERGENCE_INTERVAL_SECS,
            log_file: None,
            debug: false,
        }
    }
}

impl Config {
    pub fn converger_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".converger"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::converger_dir()?.join("converger.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        clog_debug!(
            "Config loaded: tick_period_secs={}, time_to_claim_secs={}, convergence_interval_secs={}",
            config.tick_period_secs,
            config.time_to_claim_secs,
            config.convergence_interval_secs
        );
        Ok(config)
    }

    /// Write to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(expand_tilde)
    }

    /// Runtime durations, validated.
    pub fn converger_config(&self) -> Result<ConvergerConfig> {
        let config = ConvergerConfig {
            tick_period: Duration::from_secs(self.tick_period_secs),
            time_to_claim: Duration::from_secs(self.time_to_claim_secs),
            convergence_interval: Duration::from_secs(self.convergence_interval_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
