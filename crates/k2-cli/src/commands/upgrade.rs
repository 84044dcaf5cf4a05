//! Upgrade commands - firmware upgrade and reboot recovery

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use k2_client::upgrade::{await_reboot_recovery, Delivery};
use k2_client::{
    ConvergencePoller, DeviceSession, HarnessConfig, ImageLocator, PollOutcome, ShellProbe,
    UpgradeOrchestrator, UpgradeOutcome,
};
use k2_core::ProductType;

use super::{rest_session, shell_session};
use crate::output::Output;

/// Upgrade the device to the newest release
pub async fn upgrade(
    config: &HarnessConfig,
    product: Option<ProductType>,
    download_dir: Option<&Path>,
    out: &Output,
) -> Result<()> {
    let product = product.unwrap_or(config.releases.product);
    if config.releases.host.is_empty() {
        bail!("No release server configured; set releases.host in the harness config");
    }

    let (session, monitor): (Arc<dyn DeviceSession>, Arc<dyn DeviceSession>) =
        match Delivery::for_product(product) {
            Delivery::Push => {
                let session: Arc<dyn DeviceSession> = rest_session(config).await?;
                (session.clone(), session)
            }
            Delivery::Pull => {
                let shell: Arc<dyn DeviceSession> = shell_session(config, product).await?;
                let probe: Arc<dyn DeviceSession> = Arc::new(ShellProbe::new(
                    &config.device.host,
                    config.shell.options(product),
                ));
                (shell, probe)
            }
        };

    let locator = ImageLocator::with_process_runner(config.releases.server());
    let mut orchestrator = UpgradeOrchestrator::new(session, locator)
        .with_monitor(monitor)
        .with_policies(&config.polling, &config.settle);
    if let Some(dir) = download_dir {
        orchestrator = orchestrator.with_download_dir(dir);
    }

    out.note(&format!(
        "Upgrading {} ({}) from {}:{}...",
        config.device.host, product, config.releases.host, config.releases.path
    ));
    let outcome = orchestrator.run(product).await.context("Upgrade aborted")?;

    match outcome {
        UpgradeOutcome::UpToDate { version } => {
            out.ok(&format!("Already running {}", version));
        }
        UpgradeOutcome::Upgraded { version, state } => {
            out.ok(&format!("Upgraded to {} ({})", version, state));
        }
        UpgradeOutcome::FailedConverge { reason, last_state } => {
            if let Some(state) = last_state {
                out.fail(&format!("Last state: {}", state));
            }
            bail!("Upgrade failed: {}", reason);
        }
    }
    Ok(())
}

/// Wait for a rebooted device to answer again
pub async fn await_reboot(
    config: &HarnessConfig,
    settle_secs: Option<u64>,
    out: &Output,
) -> Result<()> {
    let settle = settle_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.settle.reboot());
    let session = rest_session(config).await?;

    out.note(&format!("Waiting {:?} before polling {}...", settle, config.device.host));
    let outcome = await_reboot_recovery(
        session.as_ref(),
        &ConvergencePoller::default(),
        config.polling.reboot,
        settle,
    )
    .await
    .context("Reboot recovery failed")?;

    match outcome {
        PollOutcome::Converged { state, .. } => {
            out.ok(&format!("Device is back up ({})", state));
            Ok(())
        }
        other => bail!("Device did not come back: {}", other),
    }
}
