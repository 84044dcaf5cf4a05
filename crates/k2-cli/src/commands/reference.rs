//! Reference commands - promote a timing reference and wait for lock

use anyhow::{bail, Context, Result};
use k2_client::{HarnessConfig, ReferenceSwitcher, SwapPlan};
use k2_core::{ReferencePriorityList, TimeSource};

use super::rest_session;
use crate::output::{Output, PriorityRow};

async fn switcher(config: &HarnessConfig) -> Result<ReferenceSwitcher> {
    let session = rest_session(config).await?;
    Ok(ReferenceSwitcher::new(session, config.device.api).with_lock_policy(config.polling.lock))
}

/// Make `reference` the top-priority input, optionally waiting for lock
pub async fn switch_ref(
    config: &HarnessConfig,
    reference: &str,
    wait: bool,
    out: &Output,
) -> Result<()> {
    let switcher = switcher(config).await?;

    if wait {
        let report = switcher.apply_and_await_lock(reference).await?;
        if !report.is_locked() {
            bail!(report.summary());
        }
        out.ok(&report.summary());
        return Ok(());
    }

    let (reference, plan) = switcher.apply(reference).await?;
    match plan {
        SwapPlan::AlreadyTop => out.note(&format!("{} already has top priority", reference)),
        SwapPlan::Swap { .. } => {
            out.ok(&format!("{} now has top priority", reference));
            let list = switcher
                .priority_list()
                .await
                .context("Failed to read back the priority list")?;
            out.rows(&priority_rows(&list));
        }
    }
    Ok(())
}

/// Wait until the device locks to `reference` without switching
pub async fn await_lock(config: &HarnessConfig, reference: &str, out: &Output) -> Result<()> {
    let target: TimeSource = reference
        .parse()
        .with_context(|| format!("Invalid reference '{}'", reference))?;
    let report = switcher(config).await?.await_lock(target).await?;
    if !report.is_locked() {
        bail!(report.summary());
    }
    out.ok(&report.summary());
    Ok(())
}

fn priority_rows(list: &ReferencePriorityList) -> Vec<PriorityRow> {
    list.iter()
        .map(|entry| PriorityRow {
            reference: entry
                .time_source()
                .map(|source| source.to_string())
                .unwrap_or_else(|| format!("source {}", entry.source)),
            priority: entry.priority,
            enabled: if entry.enabled { "Yes" } else { "No" }.to_string(),
        })
        .collect()
}
