//! Setup commands - input control, GNSS constellations and NTP servers

use anyhow::{Context, Result};
use k2_client::{HarnessConfig, K2Device};

use super::rest_session;
use crate::output::Output;

async fn device(config: &HarnessConfig) -> Result<K2Device> {
    let session = rest_session(config).await?;
    Ok(K2Device::new(session, config.device.api))
}

/// Enable or disable every reference input
pub async fn inputs(config: &HarnessConfig, enable: bool, out: &Output) -> Result<()> {
    device(config)
        .await?
        .set_all_input_control(enable)
        .await
        .context("Failed to update input control")?;
    out.ok(&format!(
        "All inputs {}",
        if enable { "enabled" } else { "disabled" }
    ));
    Ok(())
}

/// Enable only the given GNSS constellations
pub async fn gnss(
    config: &HarnessConfig,
    constellations: &[String],
    sbas: bool,
    out: &Output,
) -> Result<()> {
    let names: Vec<&str> = constellations.iter().map(String::as_str).collect();
    device(config)
        .await?
        .apply_gnss_constellations(&names, sbas)
        .await
        .context("Failed to configure GNSS constellations")?;
    out.ok(&format!("Enabled constellations: {}", names.join(", ")));
    Ok(())
}

/// NTP changes, applied in field order
#[derive(Debug, Default)]
pub struct NtpArgs {
    pub clear: bool,
    pub add: Vec<String>,
    pub prefer: Option<String>,
    pub gnss_prefer: Option<bool>,
    pub restart: bool,
}

/// Reconfigure the NTP servers
pub async fn ntp(config: &HarnessConfig, args: &NtpArgs, out: &Output) -> Result<()> {
    let device = device(config).await?;

    if args.clear {
        let removed = device.delete_all_ntp_servers().await?;
        out.note(&format!("Deleted {} NTP server(s)", removed));
    }
    if !args.add.is_empty() {
        let addresses: Vec<&str> = args.add.iter().map(String::as_str).collect();
        device.add_ntp_servers(&addresses).await?;
        out.note(&format!("Added {}", addresses.join(", ")));
    }
    if let Some(server) = &args.prefer {
        if !device.set_ntp_prefer(server, true).await? {
            out.fail(&format!("NTP server {} is not configured", server));
        }
    }
    if let Some(prefer) = args.gnss_prefer {
        device.set_gnss_prefer(prefer).await?;
    }
    if args.restart {
        device.restart_ntp().await?;
    }
    out.ok("NTP configuration updated");
    Ok(())
}
