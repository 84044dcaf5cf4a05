//! Shell commands - alarms, GNSS receiver status and gateway reachability
//! over the device CLI

use anyhow::{bail, Context, Result};
use k2_client::{HarnessConfig, K2Device};

use super::shell_session;
use crate::output::{or_dash, AlarmRow, Output, SatelliteRow};

async fn device(config: &HarnessConfig) -> Result<K2Device> {
    let shell = shell_session(config, config.releases.product).await?;
    Ok(K2Device::new(shell.clone(), config.device.api)
        .with_shell(shell)
        .with_ping_policy(config.polling.gateway_ping))
}

/// List active alarms
pub async fn alarms(config: &HarnessConfig, out: &Output) -> Result<()> {
    let alarms = device(config)
        .await?
        .alarms()
        .await
        .context("Failed to read alarms")?;

    if alarms.is_empty() {
        out.note("No active alarms");
        return Ok(());
    }

    let rows: Vec<AlarmRow> = alarms
        .into_iter()
        .map(|alarm| AlarmRow {
            id: alarm.event_id,
            severity: alarm.severity.to_string(),
            description: alarm.description,
        })
        .collect();
    out.rows(&rows);
    Ok(())
}

/// Show the GNSS receiver status and the satellites it tracks
pub async fn gnss_status(config: &HarnessConfig, out: &Output) -> Result<()> {
    let (status, satellites) = device(config)
        .await?
        .gnss_status()
        .await
        .context("Failed to read GNSS status")?;

    out.fields(&[
        ("Receiver", or_dash(status.receiver_status)),
        ("Antenna", or_dash(status.antenna_status)),
        ("Fix Quality", or_dash(status.fix_quality)),
        ("Used Satellites", or_dash(status.used_satellites)),
        ("Latitude", or_dash(status.latitude)),
        ("Longitude", or_dash(status.longitude)),
    ]);

    let rows: Vec<SatelliteRow> = satellites
        .into_iter()
        .map(|sat| SatelliteRow {
            sat_id: sat.sat_id,
            gnss: sat.gnss_id,
            snr: sat.snr,
            azimuth: sat.azimuth,
            elevation: sat.elevation,
            pr_res: sat.pr_res,
        })
        .collect();
    out.rows(&rows);
    Ok(())
}

/// Ping the gateway from the device until every round is clean
pub async fn ping_gateway(config: &HarnessConfig, out: &Output) -> Result<()> {
    let outcome = device(config)
        .await?
        .gateway_ping()
        .await
        .context("Gateway ping failed")?;

    if !outcome.is_converged() {
        bail!("Gateway ping failed: {}", outcome);
    }
    out.ok(&format!(
        "Gateway reachable: {} rounds with 0% packet loss",
        outcome.attempts()
    ));
    Ok(())
}
