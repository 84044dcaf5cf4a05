//! State commands - device snapshot and clock class

use anyhow::{Context, Result};
use k2_client::{DeviceSession, HarnessConfig, K2Device};

use super::rest_session;
use crate::output::{or_dash, Output};

/// Show the current device state
pub async fn state(config: &HarnessConfig, out: &Output) -> Result<()> {
    let session = rest_session(config).await?;
    let state = session
        .get_state()
        .await
        .context("Failed to read device state")?;

    out.fields(&[
        ("Host", config.device.host.clone()),
        ("API", config.device.api.to_string()),
        ("Sync State", or_dash(state.sync_state)),
        ("Reference", or_dash(state.current_reference)),
        ("Version", or_dash(state.software_version.as_deref())),
        ("Oscillator", or_dash(state.oscillator.as_deref())),
        ("Captured", state.captured_at.to_rfc3339()),
    ]);
    Ok(())
}

/// Show the PTP clock class
pub async fn clock_class(config: &HarnessConfig, out: &Output) -> Result<()> {
    let session = rest_session(config).await?;
    let class = K2Device::new(session, config.device.api)
        .clock_class()
        .await
        .context("Failed to read clock class")?;
    out.fields(&[("Clock Class", class.to_string())]);
    Ok(())
}
