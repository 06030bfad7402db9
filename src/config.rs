use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::classify::LOCK_WAIT_TIMEOUT;

pub const DEFAULT_CONFIG_PATH: &str = "mysql-replay.toml";
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(alias = "Dsn")]
    pub dsn: String,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);
        Self::from_path(path)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.dsn.trim().is_empty() {
            bail!("`dsn` cannot be empty");
        }
        if self.replay.queue_capacity == 0 {
            bail!("`replay.queue_capacity` must be greater than zero");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReplayConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_ignorable_error_codes")]
    pub ignorable_error_codes: Vec<u16>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ignorable_error_codes: default_ignorable_error_codes(),
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_ignorable_error_codes() -> Vec<u16> {
    vec![LOCK_WAIT_TIMEOUT]
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}
