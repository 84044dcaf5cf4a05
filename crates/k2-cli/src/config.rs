//! Configuration file handling for k2-cli

use anyhow::{bail, Context, Result};
use k2_client::HarnessConfig;
use k2_core::ApiGeneration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Defaults for the CLI tool (`~/.config/k2-cli/config.toml`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default device address
    pub host: Option<String>,
    /// Default API generation (v1 or v2)
    pub api: Option<ApiGeneration>,
    /// REST API user
    pub user: Option<String>,
    /// REST API password
    pub password: Option<String>,
    /// Default output format
    pub output: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("k2-cli");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(&self, args: DeviceArgs<'_>, output: Option<&str>, no_color: bool) -> MergedConfig {
        MergedConfig {
            host: args.host.map(String::from).or_else(|| self.host.clone()),
            api: args.api.or(self.api),
            user: args.user.map(String::from).or_else(|| self.user.clone()),
            password: args.password.map(String::from).or_else(|| self.password.clone()),
            output: output
                .map(String::from)
                .or_else(|| self.output.clone())
                .unwrap_or_else(|| "table".to_string()),
            no_color: no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Device options given on the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceArgs<'a> {
    pub host: Option<&'a str>,
    pub api: Option<ApiGeneration>,
    pub user: Option<&'a str>,
    pub password: Option<&'a str>,
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct MergedConfig {
    pub host: Option<String>,
    pub api: Option<ApiGeneration>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub output: String,
    pub no_color: bool,
}

impl MergedConfig {
    /// Harness configuration: the YAML file if given, with the merged device
    /// options applied on top
    pub fn harness(&self, yaml: Option<&Path>) -> Result<HarnessConfig> {
        let mut harness = match (yaml, &self.host) {
            (Some(path), _) => HarnessConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load harness config: {}", path.display()))?,
            (None, Some(host)) => HarnessConfig::builder(host.clone()).build(),
            (None, None) => {
                let defaults = Config::config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "config.toml".to_string());
                bail!("No device given; use --host, --config or set host in {}", defaults)
            }
        };

        if let Some(host) = &self.host {
            harness.device.host = host.clone();
        }
        if let Some(api) = self.api {
            harness.device.api = api;
        }
        if let Some(user) = &self.user {
            harness.device.user = user.clone();
        }
        if let Some(password) = &self.password {
            harness.device.password = password.clone();
        }
        Ok(harness)
    }
}
