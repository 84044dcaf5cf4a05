//! Promoting a timing reference to top priority
//!
//! The device picks its time reference from `timeRefPriority`, lowest
//! priority value first. Promoting a reference swaps its priority with the
//! current top entry; every other entry keeps its value. The result is then
//! renumbered for the API generation before it is written back.

use std::sync::Arc;

use k2_core::{ApiGeneration, DeviceState, ReferencePriorityList, ReferenceSource, TimeSource};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::error::DeviceError;
use crate::poll::{ConvergencePoller, PollOutcome, PollPolicy, Verdict};
use crate::session::DeviceSession;

const TIMING_PATH: &str = "/timing";

/// Errors from switching references
#[derive(Error, Debug)]
pub enum SwitchError {
    /// Name is not one of the promotable references
    #[error("Invalid reference '{0}'; expected one of GNSS, Slot A J1 Timecode, Slot B J1 Timecode, PTP")]
    UnknownReference(String),

    /// Reference is valid but missing from the device's input priority list
    #[error("Reference {0} is not listed in input control")]
    ReferenceNotConfigured(TimeSource),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// What has to change to put a reference on top
#[derive(Debug, Clone, PartialEq)]
pub enum SwapPlan {
    /// Reference already has top priority; nothing is written
    AlreadyTop,
    /// Write `list` (already in write numbering)
    Swap {
        list: ReferencePriorityList,
        top_index: usize,
        reference_index: usize,
    },
}

/// Check `name` against the promotable references and the device's list
pub fn validate(name: &str, list: &ReferencePriorityList) -> Result<TimeSource, SwitchError> {
    let reference: TimeSource = name
        .parse()
        .map_err(|_| SwitchError::UnknownReference(name.to_string()))?;
    if !list.contains(reference) {
        return Err(SwitchError::ReferenceNotConfigured(reference));
    }
    Ok(reference)
}

/// Swap the priorities of `reference` and the current top entry
///
/// `list` is in read numbering; the returned list is in write numbering.
pub fn compute_swap(
    reference: TimeSource,
    list: &ReferencePriorityList,
    generation: ApiGeneration,
) -> Result<SwapPlan, SwitchError> {
    let reference_index = list
        .position_of(reference)
        .ok_or(SwitchError::ReferenceNotConfigured(reference))?;
    let top_index = list
        .top_index()
        .ok_or(SwitchError::ReferenceNotConfigured(reference))?;

    if top_index == reference_index {
        return Ok(SwapPlan::AlreadyTop);
    }

    let mut swapped = list.clone();
    swapped.swap_priorities(top_index, reference_index);
    Ok(SwapPlan::Swap {
        list: generation.to_wire(&swapped),
        top_index,
        reference_index,
    })
}

/// Result of waiting for a lock
#[derive(Debug, Clone, PartialEq)]
pub struct LockReport {
    pub target: TimeSource,
    pub outcome: PollOutcome<DeviceState>,
}

impl LockReport {
    pub fn is_locked(&self) -> bool {
        self.outcome.is_converged()
    }

    /// Reference the device followed at the last observation
    pub fn locked_to(&self) -> Option<ReferenceSource> {
        self.outcome
            .last_state()
            .and_then(|state| state.current_reference)
    }

    pub fn summary(&self) -> String {
        fn or_unknown<T: ToString>(value: Option<T>) -> String {
            value.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into())
        }

        match &self.outcome {
            PollOutcome::Converged { .. } => format!("Locked to {}.", self.target),
            PollOutcome::TimedOut {
                last_state: Some(state),
                ..
            } => format!(
                "FAILED. Timed out before locking. Currently locked to {}. Current sync state = {}.",
                or_unknown(state.current_reference),
                or_unknown(state.sync_state)
            ),
            PollOutcome::TimedOut {
                last_state: None, ..
            } => format!(
                "FAILED. Device never answered while waiting to lock to {}.",
                self.target
            ),
            PollOutcome::Diverged { reason, .. } => format!("FAILED. {}", reason),
        }
    }
}

/// Reads, rewrites and watches the reference priority list of one device
pub struct ReferenceSwitcher {
    session: Arc<dyn DeviceSession>,
    generation: ApiGeneration,
    poller: ConvergencePoller,
    lock_policy: PollPolicy,
}

impl ReferenceSwitcher {
    pub fn new(session: Arc<dyn DeviceSession>, generation: ApiGeneration) -> Self {
        Self {
            session,
            generation,
            poller: ConvergencePoller::default(),
            lock_policy: PollPolicy::lock(),
        }
    }

    pub fn with_poller(mut self, poller: ConvergencePoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_lock_policy(mut self, policy: PollPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Current `timeRefPriority`, in read numbering
    pub async fn priority_list(&self) -> Result<ReferencePriorityList, SwitchError> {
        let timing = self.session.get_resource(TIMING_PATH).await?;
        parse_priority_list(&timing).map_err(Into::into)
    }

    /// Make `name` the top-priority reference
    ///
    /// Validation happens before anything is written; a reference that is
    /// already on top leaves the device untouched.
    #[instrument(skip(self), fields(api = %self.generation))]
    pub async fn apply(&self, name: &str) -> Result<(TimeSource, SwapPlan), SwitchError> {
        let list = self
            .priority_list()
            .await
            .inspect_err(|e| error!("Failed to read the reference priority list: {}", e))?;
        let reference = validate(name, &list)
            .inspect_err(|e| error!(priorities = ?list.priorities(), "{}", e))?;

        let top = list.top_index().map(|index| list.entries()[index].priority);
        if top != Some(self.generation.read_base()) {
            warn!(
                "Top priority is {:?}, expected {} for API {}",
                top,
                self.generation.read_base(),
                self.generation
            );
        }

        let plan = compute_swap(reference, &list, self.generation)?;
        match &plan {
            SwapPlan::AlreadyTop => info!("{} already has top priority", reference),
            SwapPlan::Swap {
                list: wire,
                top_index,
                reference_index,
            } => {
                info!(
                    "Switching {:?} with {:?}",
                    list.entries()[*reference_index],
                    list.entries()[*top_index]
                );
                let body = json!({"timing": {"timeRefPriority": wire}});
                self.session
                    .put_resource(TIMING_PATH, &body)
                    .await
                    .inspect_err(|e| {
                        error!(priorities = ?list.priorities(), "Failed to write {:?}: {}", wire, e)
                    })?;
                info!("Successfully switched input references");
            }
        }
        Ok((reference, plan))
    }

    /// [`apply`](Self::apply), then wait for the device to lock to the reference
    pub async fn apply_and_await_lock(&self, name: &str) -> Result<LockReport, SwitchError> {
        let (reference, _) = self.apply(name).await?;
        self.await_lock(reference).await
    }

    /// Poll until the device is `Locked` and following `reference`
    #[instrument(skip(self))]
    pub async fn await_lock(&self, reference: TimeSource) -> Result<LockReport, SwitchError> {
        let expected = reference.reference();
        let outcome = self
            .poller
            .poll_until(
                "reference lock",
                self.lock_policy,
                || self.session.get_state(),
                |state: &DeviceState| {
                    if state.is_locked_to(expected) {
                        Verdict::Satisfied
                    } else {
                        Verdict::NotYetSatisfied
                    }
                },
            )
            .await
            .inspect_err(|e| error!("Failed to read state while waiting to lock to {}: {}", reference, e))?;

        let report = LockReport {
            target: reference,
            outcome,
        };
        if report.is_locked() {
            info!("Successfully locked to {}", reference);
        } else {
            error!(
                last_state = ?report.outcome.last_state(),
                "Failed to lock to {}: {}",
                reference,
                report.summary()
            );
        }
        Ok(report)
    }
}

/// `timeRefPriority` out of a `GET /timing` body
pub fn parse_priority_list(timing: &Value) -> Result<ReferencePriorityList, DeviceError> {
    let raw = timing
        .get("timeRefPriority")
        .ok_or_else(|| DeviceError::Parse("timing has no timeRefPriority".to_string()))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| DeviceError::Parse(format!("timeRefPriority: {}", e)))
}
