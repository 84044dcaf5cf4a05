//! Command implementations for k2-cli

pub mod reference;
pub mod setup;
pub mod shell;
pub mod state;
pub mod upgrade;

pub use reference::{await_lock, switch_ref};
pub use setup::{gnss, inputs, ntp, NtpArgs};
pub use shell::{alarms, gnss_status, ping_gateway};
pub use state::{clock_class, state};
pub use upgrade::{await_reboot, upgrade};

use std::sync::Arc;

use anyhow::{Context, Result};
use k2_client::{HarnessConfig, RestSession, ShellSession};
use k2_core::ProductType;

/// Open the REST session to the configured device
pub async fn rest_session(config: &HarnessConfig) -> Result<Arc<RestSession>> {
    let session = RestSession::connect(&config.device, &config.timeouts)
        .await
        .with_context(|| format!("Failed to connect to {}", config.device.host))?;
    Ok(Arc::new(session))
}

/// Log in to the device CLI over ssh
pub async fn shell_session(config: &HarnessConfig, product: ProductType) -> Result<Arc<ShellSession>> {
    let session = ShellSession::connect(&config.device.host, config.shell.options(product))
        .await
        .with_context(|| format!("Failed to log in to {}", config.device.host))?;
    Ok(Arc::new(session))
}
