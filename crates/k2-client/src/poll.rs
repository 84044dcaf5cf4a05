//! Bounded-retry convergence polling
//!
//! Every wait in the harness (upgrade version check, reboot recovery, lock
//! to a reference, gateway ping) goes through [`ConvergencePoller::poll_until`]:
//! fetch a fresh observation, classify it with a predicate, and either stop or
//! sleep and try again, up to a fixed number of attempts.
//!
//! Attempt accounting:
//! - an attempt is one call to `fetch`, whether it succeeded or hit a
//!   transient error
//! - with `max_attempts = N` the poller fetches at most N times and sleeps at
//!   most N - 1 times (no sleep after the last attempt)
//! - `Satisfied` and `DefinitelyFailed` return immediately, without sleeping

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::error::DeviceError;

/// Errors that a poller may absorb and retry
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for DeviceError {
    fn is_transient(&self) -> bool {
        DeviceError::is_transient(self)
    }
}

/// Classification of one observation against the target condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Target reached
    Satisfied,
    /// Not there yet; waiting may help
    NotYetSatisfied,
    /// Observation proves the target cannot be reached
    DefinitelyFailed(String),
}

/// Result of a polling run
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<S> {
    Converged {
        state: S,
        attempts: u32,
    },
    /// Budget exhausted; `last_state` is `None` if the device never answered
    TimedOut {
        last_state: Option<S>,
        attempts: u32,
    },
    Diverged {
        state: S,
        reason: String,
        attempts: u32,
    },
}

impl<S> PollOutcome<S> {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    /// Number of fetches performed
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Converged { attempts, .. }
            | Self::TimedOut { attempts, .. }
            | Self::Diverged { attempts, .. } => *attempts,
        }
    }

    /// Most recent successful observation
    pub fn last_state(&self) -> Option<&S> {
        match self {
            Self::Converged { state, .. } | Self::Diverged { state, .. } => Some(state),
            Self::TimedOut { last_state, .. } => last_state.as_ref(),
        }
    }

    pub fn into_last_state(self) -> Option<S> {
        match self {
            Self::Converged { state, .. } | Self::Diverged { state, .. } => Some(state),
            Self::TimedOut { last_state, .. } => last_state,
        }
    }
}

impl<S> fmt::Display for PollOutcome<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged { attempts, .. } => write!(f, "converged after {} attempt(s)", attempts),
            Self::TimedOut { attempts, .. } => write!(f, "timed out after {} attempt(s)", attempts),
            Self::Diverged {
                reason, attempts, ..
            } => write!(f, "diverged on attempt {}: {}", attempts, reason),
        }
    }
}

/// Attempt budget and spacing for one polling call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl PollPolicy {
    /// A zero budget is raised to one attempt
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Software version check after an upgrade: 10 × 60 s
    pub fn upgrade() -> Self {
        Self::new(10, Duration::from_secs(60))
    }

    /// Reboot recovery: 10 × 5 s
    pub fn reboot() -> Self {
        Self::new(10, Duration::from_secs(5))
    }

    /// Lock to a reference: 30 × 60 s
    pub fn lock() -> Self {
        Self::new(30, Duration::from_secs(60))
    }

    /// Gateway ping rounds: 5 × 5 s
    pub fn gateway_ping() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Blocking pause between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Generic bounded-retry polling engine
#[derive(Clone)]
pub struct ConvergencePoller {
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for ConvergencePoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvergencePoller").finish_non_exhaustive()
    }
}

impl Default for ConvergencePoller {
    fn default() -> Self {
        Self::new(Arc::new(TokioSleeper))
    }
}

impl ConvergencePoller {
    pub fn new(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    /// Fixed wait for devices that give no progress signal (e.g. before a
    /// reboot starts)
    pub async fn settle(&self, reason: &str, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        info!("Waiting {:?} for {}", duration, reason);
        self.sleeper.sleep(duration).await;
    }

    /// Poll until `predicate` accepts a fetched observation, rejects it for
    /// good, or `policy.max_attempts` fetches have been made
    ///
    /// Transient fetch errors (see [`Transient`]) consume an attempt and are
    /// otherwise absorbed. Any other fetch error aborts the run and is
    /// returned as `Err`.
    #[instrument(skip_all, fields(goal = target, max_attempts = policy.max_attempts))]
    pub async fn poll_until<S, E, F, Fut, P>(
        &self,
        target: &str,
        policy: PollPolicy,
        mut fetch: F,
        mut predicate: P,
    ) -> Result<PollOutcome<S>, E>
    where
        S: fmt::Debug,
        E: Transient + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S, E>>,
        P: FnMut(&S) -> Verdict,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_state = None;

        for attempt in 1..=max_attempts {
            match fetch().await {
                Ok(state) => match predicate(&state) {
                    Verdict::Satisfied => {
                        info!(attempt, "{} reached", target);
                        return Ok(PollOutcome::Converged {
                            state,
                            attempts: attempt,
                        });
                    }
                    Verdict::DefinitelyFailed(reason) => {
                        warn!(attempt, ?state, "{} cannot be reached: {}", target, reason);
                        return Ok(PollOutcome::Diverged {
                            state,
                            reason,
                            attempts: attempt,
                        });
                    }
                    Verdict::NotYetSatisfied => {
                        debug!(attempt, ?state, "{} not reached yet", target);
                        last_state = Some(state);
                    }
                },
                Err(e) if e.is_transient() => {
                    warn!(attempt, "Device unreachable while waiting for {}: {}", target, e);
                }
                Err(e) => {
                    error!(attempt, ?last_state, "Stopped waiting for {}: {}", target, e);
                    return Err(e);
                }
            }

            if attempt < max_attempts {
                self.sleeper.sleep(policy.interval()).await;
            }
        }

        warn!(?last_state, "Gave up waiting for {} after {} attempts", target, max_attempts);
        Ok(PollOutcome::TimedOut {
            last_state,
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSleeper;
    use std::cell::Cell;

    fn poller() -> (ConvergencePoller, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        (ConvergencePoller::new(sleeper.clone()), sleeper)
    }

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy::new(max_attempts, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_never_satisfied_times_out_after_exactly_n_attempts() {
        for n in 1..=6 {
            let (poller, sleeper) = poller();
            let fetches = Cell::new(0u32);

            let outcome = poller
                .poll_until(
                    "nothing",
                    policy(n),
                    || {
                        fetches.set(fetches.get() + 1);
                        async { Ok::<_, DeviceError>(7u32) }
                    },
                    |_| Verdict::NotYetSatisfied,
                )
                .await
                .unwrap();

            assert_eq!(fetches.get(), n);
            assert_eq!(outcome, PollOutcome::TimedOut { last_state: Some(7), attempts: n });
            assert_eq!(sleeper.count(), (n - 1) as usize);
        }
    }

    #[tokio::test]
    async fn test_satisfied_on_first_attempt_never_sleeps() {
        let (poller, sleeper) = poller();

        let outcome = poller
            .poll_until(
                "immediate",
                policy(10),
                || async { Ok::<_, DeviceError>("ready") },
                |_| Verdict::Satisfied,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Converged { state: "ready", attempts: 1 });
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn test_definitely_failed_stops_early() {
        let (poller, sleeper) = poller();
        let fetches = Cell::new(0u32);

        let outcome = poller
            .poll_until(
                "version",
                policy(10),
                || {
                    fetches.set(fetches.get() + 1);
                    let n = fetches.get();
                    async move { Ok::<_, DeviceError>(n) }
                },
                |n| {
                    if *n == 3 {
                        Verdict::DefinitelyFailed("wrong version".into())
                    } else {
                        Verdict::NotYetSatisfied
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(fetches.get(), 3);
        assert_eq!(sleeper.count(), 2);
        assert_eq!(
            outcome,
            PollOutcome::Diverged {
                state: 3,
                reason: "wrong version".into(),
                attempts: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_connection_errors_consume_budget() {
        let (poller, sleeper) = poller();
        let fetches = Cell::new(0u32);

        let outcome = poller
            .poll_until(
                "reboot",
                policy(4),
                || {
                    fetches.set(fetches.get() + 1);
                    async { Err::<u32, _>(DeviceError::ConnectionFailed("refused".into())) }
                },
                |_| Verdict::Satisfied,
            )
            .await
            .unwrap();

        assert_eq!(fetches.get(), 4);
        assert_eq!(sleeper.count(), 3);
        assert_eq!(outcome, PollOutcome::TimedOut { last_state: None, attempts: 4 });
    }

    #[tokio::test]
    async fn test_recovers_after_transient_errors() {
        let (poller, sleeper) = poller();
        let fetches = Cell::new(0u32);

        let outcome = poller
            .poll_until(
                "reboot",
                policy(10),
                || {
                    fetches.set(fetches.get() + 1);
                    let n = fetches.get();
                    async move {
                        if n < 3 {
                            Err(DeviceError::Timeout)
                        } else {
                            Ok(n)
                        }
                    }
                },
                |_| Verdict::Satisfied,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Converged { state: 3, attempts: 3 });
        assert_eq!(sleeper.durations(), vec![Duration::from_secs(60); 2]);
    }

    #[tokio::test]
    async fn test_last_state_survives_later_outage() {
        let (poller, _) = poller();
        let fetches = Cell::new(0u32);

        let outcome = poller
            .poll_until(
                "lock",
                policy(3),
                || {
                    fetches.set(fetches.get() + 1);
                    let n = fetches.get();
                    async move {
                        if n == 1 {
                            Ok("holdover")
                        } else {
                            Err(DeviceError::ConnectionFailed("reset".into()))
                        }
                    }
                },
                |_| Verdict::NotYetSatisfied,
            )
            .await
            .unwrap();

        assert_eq!(outcome.last_state(), Some(&"holdover"));
        assert_eq!(outcome.attempts(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_returned() {
        let (poller, sleeper) = poller();

        let result = poller
            .poll_until(
                "state",
                policy(10),
                || async { Err::<u32, _>(DeviceError::http_status(401, "Unauthorized")) },
                |_| Verdict::Satisfied,
            )
            .await;

        assert!(matches!(result, Err(DeviceError::HttpStatus { status: 401, .. })));
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn test_settle_skips_zero_duration() {
        let (poller, sleeper) = poller();
        poller.settle("nothing", Duration::ZERO).await;
        poller.settle("reboot", Duration::from_secs(360)).await;
        assert_eq!(sleeper.durations(), vec![Duration::from_secs(360)]);
    }

    #[test]
    fn test_zero_budget_is_raised_to_one() {
        assert_eq!(PollPolicy::new(0, Duration::from_secs(1)).max_attempts, 1);
        assert_eq!(PollPolicy::lock().interval(), Duration::from_secs(60));
    }
}
