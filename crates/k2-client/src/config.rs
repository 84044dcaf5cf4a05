//! Harness configuration with YAML support

use std::path::Path;
use std::time::Duration;

use k2_core::{ApiGeneration, ProductType};
use serde::{Deserialize, Serialize};

use crate::image::ReleaseServer;
use crate::poll::PollPolicy;
use crate::session::ShellOptions;

/// Harness configuration
///
/// Can be loaded from YAML or constructed programmatically. Only `device` is
/// required; every other section has defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Device under test
    pub device: DeviceConfig,

    /// Interactive CLI login
    #[serde(default)]
    pub shell: ShellConfig,

    /// Release build server
    #[serde(default)]
    pub releases: ReleasesConfig,

    /// Attempt budgets for each wait
    #[serde(default)]
    pub polling: PollingConfig,

    /// Fixed waits with no progress signal
    #[serde(default)]
    pub settle: SettleConfig,

    /// HTTP timeouts
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

/// REST API connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device address (IP or hostname)
    pub host: String,

    /// API generation (default: v2)
    #[serde(default)]
    pub api: ApiGeneration,

    #[serde(default = "default_api_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,
}

fn default_api_user() -> String {
    "admin".to_string()
}

/// SSH login to the device CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_shell_user")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Password for `su`
    #[serde(default)]
    pub root_password: Option<String>,

    /// Prompt regex (default: the product's CLI prompt)
    #[serde(default)]
    pub prompt: Option<String>,

    /// Longest wait for a prompt in milliseconds (default: 5 minutes)
    #[serde(default = "default_shell_timeout")]
    pub timeout_ms: u64,

    /// Remove the device from known_hosts before connecting (default: true)
    #[serde(default = "default_true")]
    pub reset_known_hosts: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            user: default_shell_user(),
            password: None,
            root_password: None,
            prompt: None,
            timeout_ms: default_shell_timeout(),
            reset_known_hosts: true,
        }
    }
}

impl ShellConfig {
    /// Session options for a device of the given product
    pub fn options(&self, product: ProductType) -> ShellOptions {
        ShellOptions {
            user: self.user.clone(),
            password: self.password.clone(),
            root_password: self.root_password.clone(),
            prompt: self
                .prompt
                .clone()
                .unwrap_or_else(|| product.default_prompt().to_string()),
            timeout: Duration::from_millis(self.timeout_ms),
            reset_known_hosts: self.reset_known_hosts,
        }
    }
}

fn default_shell_user() -> String {
    "testuser".to_string()
}

fn default_shell_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_true() -> bool {
    true
}

/// Build server holding dated release folders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasesConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_shell_user")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Directory containing the `YYYY_MM_DD_sdk` folders
    #[serde(default = "default_release_path")]
    pub path: String,

    /// Product whose images are selected (default: k2)
    #[serde(default = "default_product")]
    pub product: ProductType,
}

impl Default for ReleasesConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: default_shell_user(),
            password: None,
            path: default_release_path(),
            product: default_product(),
        }
    }
}

impl ReleasesConfig {
    pub fn server(&self) -> ReleaseServer {
        ReleaseServer {
            host: self.host.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            path: self.path.clone(),
        }
    }
}

fn default_release_path() -> String {
    "/builds".to_string()
}

fn default_product() -> ProductType {
    ProductType::K2
}

/// Attempt budgets per call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Software version after an upgrade (default: 10 x 60s)
    #[serde(default = "PollPolicy::upgrade")]
    pub upgrade: PollPolicy,

    /// Device answering again after a reboot (default: 10 x 5s)
    #[serde(default = "PollPolicy::reboot")]
    pub reboot: PollPolicy,

    /// Lock to a reference (default: 30 x 60s)
    #[serde(default = "PollPolicy::lock")]
    pub lock: PollPolicy,

    /// Consecutive clean gateway pings (default: 5 x 5s)
    #[serde(default = "PollPolicy::gateway_ping")]
    pub gateway_ping: PollPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            upgrade: PollPolicy::upgrade(),
            reboot: PollPolicy::reboot(),
            lock: PollPolicy::lock(),
            gateway_ping: PollPolicy::gateway_ping(),
        }
    }
}

/// Fixed waits in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleConfig {
    /// After the upgrade upload, before polling the version (default: 6 minutes)
    #[serde(default = "default_settle")]
    pub upgrade_ms: u64,

    /// After a reboot, before polling recovery (default: 6 minutes)
    #[serde(default = "default_settle")]
    pub reboot_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            upgrade_ms: default_settle(),
            reboot_ms: default_settle(),
        }
    }
}

impl SettleConfig {
    pub fn upgrade(&self) -> Duration {
        Duration::from_millis(self.upgrade_ms)
    }

    pub fn reboot(&self) -> Duration {
        Duration::from_millis(self.reboot_ms)
    }
}

fn default_settle() -> u64 {
    360_000 // 6 minutes
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// General request timeout in milliseconds (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_ms: u64,

    /// Connect timeout in milliseconds (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,

    /// Image upload timeout in milliseconds (default: 10 minutes)
    #[serde(default = "default_upload_timeout")]
    pub upload_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_timeout(),
            connect_ms: default_connect_timeout(),
            upload_ms: default_upload_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_upload_timeout() -> u64 {
    600_000 // 10 minutes
}

impl HarnessConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize configuration to YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Create a builder for programmatic configuration
    pub fn builder(host: impl Into<String>) -> HarnessConfigBuilder {
        HarnessConfigBuilder::new(host)
    }
}

/// Builder for HarnessConfig
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    /// Create a new builder for the given device address
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: HarnessConfig {
                device: DeviceConfig {
                    host: host.into(),
                    api: ApiGeneration::default(),
                    user: default_api_user(),
                    password: String::new(),
                },
                shell: ShellConfig::default(),
                releases: ReleasesConfig::default(),
                polling: PollingConfig::default(),
                settle: SettleConfig::default(),
                timeouts: TimeoutsConfig::default(),
            },
        }
    }

    pub fn api(mut self, api: ApiGeneration) -> Self {
        self.config.device.api = api;
        self
    }

    /// Set REST API credentials
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.device.user = user.into();
        self.config.device.password = password.into();
        self
    }

    /// Set CLI login credentials
    pub fn shell_login(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
        root_password: impl Into<String>,
    ) -> Self {
        self.config.shell.user = user.into();
        self.config.shell.password = Some(password.into());
        self.config.shell.root_password = Some(root_password.into());
        self
    }

    /// Set the release server
    pub fn releases(mut self, server: ReleaseServer, product: ProductType) -> Self {
        self.config.releases = ReleasesConfig {
            host: server.host,
            user: server.user,
            password: server.password,
            path: server.path,
            product,
        };
        self
    }

    pub fn polling(mut self, polling: PollingConfig) -> Self {
        self.config.polling = polling;
        self
    }

    pub fn settle(mut self, settle: SettleConfig) -> Self {
        self.config.settle = settle;
        self
    }

    /// Set request timeout in milliseconds
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.request_ms = ms;
        self
    }

    /// Build the configuration
    pub fn build(self) -> HarnessConfig {
        self.config
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}
