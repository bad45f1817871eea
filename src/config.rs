//! Host configuration (YAML)

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono_tz::Tz;
use serde::Deserialize;

use crate::integrations::openweather::config_flow::UserInput;
use crate::integrations::openweather::API_ENDPOINT;

const DEFAULT_CONFIG_PATH: &str = "onecall.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub http_port: u16,
    /// IANA zone used for `local_time` attributes.
    pub time_zone: String,
    pub storage_path: PathBuf,
    pub api_endpoint: String,
    /// Imported as config entries at startup.
    pub locations: Vec<UserInput>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            http_port: 8124,
            time_zone: "UTC".to_string(),
            storage_path: PathBuf::from("onecall.db"),
            api_endpoint: API_ENDPOINT.to_string(),
            locations: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Load from `ONECALL_CONFIG` (default `onecall.yaml`) and apply
    /// `ONECALL_HTTP_PORT`.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("ONECALL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(Path::new(&path))?;
        if let Some(port) = std::env::var("ONECALL_HTTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.http_port = port;
        }
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn time_zone(&self) -> anyhow::Result<Tz> {
        self.time_zone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid time_zone {:?}: {}", self.time_zone, e))
    }
}
