//! Firmware upgrade sequencing
//!
//! ```text
//! Idle -> ImageAcquired -> VersionCompared -+-> UpToDate
//!                                           |
//!                                           +-> Uploading -> Rebooting -> AwaitingConvergence -+-> Upgraded
//!                                                                                              +-> FailedConverge
//! ```
//!
//! K2 devices receive the image files over the REST API (push). TimeProvider
//! 4100 devices fetch them from the release server themselves when told to
//! over the CLI (pull).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k2_core::{DeviceState, ImageDescriptor, ProductType};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::{PollingConfig, SettleConfig};
use crate::error::DeviceError;
use crate::image::{ImageError, ImageLocator};
use crate::poll::{ConvergencePoller, PollOutcome, PollPolicy, Verdict};
use crate::session::DeviceSession;

/// Errors that abort an upgrade before it can converge
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// How an upgrade run ended
#[derive(Debug, Clone, PartialEq)]
pub enum UpgradeOutcome {
    /// The device already runs the release version; nothing was transferred
    UpToDate { version: String },
    /// The device came back on the new version
    Upgraded { version: String, state: DeviceState },
    /// The device never reported the new version, or did not recover
    FailedConverge {
        reason: String,
        last_state: Option<DeviceState>,
    },
}

impl UpgradeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::FailedConverge { .. })
    }
}

/// How image files reach the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Download locally, then upload over the REST API
    Push,
    /// The device copies the files from the release server
    Pull,
}

impl Delivery {
    pub fn for_product(product: ProductType) -> Self {
        match product {
            ProductType::K2 => Self::Push,
            ProductType::Tp4100 => Self::Pull,
        }
    }
}

/// Runs one upgrade against one device
pub struct UpgradeOrchestrator {
    session: Arc<dyn DeviceSession>,
    monitor: Arc<dyn DeviceSession>,
    locator: ImageLocator,
    poller: ConvergencePoller,
    version_policy: PollPolicy,
    reboot_policy: PollPolicy,
    settle: Duration,
    download_dir: PathBuf,
}

impl UpgradeOrchestrator {
    /// Orchestrator with the default budgets (version 10 x 60s, reboot
    /// 10 x 5s, 6 minute settle) that downloads into the working directory
    pub fn new(session: Arc<dyn DeviceSession>, locator: ImageLocator) -> Self {
        Self {
            monitor: session.clone(),
            session,
            locator,
            poller: ConvergencePoller::default(),
            version_policy: PollPolicy::upgrade(),
            reboot_policy: PollPolicy::reboot(),
            settle: SettleConfig::default().upgrade(),
            download_dir: PathBuf::from("."),
        }
    }

    /// Session used for the post-upgrade polls (default: the upgrade session)
    pub fn with_monitor(mut self, monitor: Arc<dyn DeviceSession>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_poller(mut self, poller: ConvergencePoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_policies(mut self, polling: &PollingConfig, settle: &SettleConfig) -> Self {
        self.version_policy = polling.upgrade;
        self.reboot_policy = polling.reboot;
        self.settle = settle.upgrade();
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Upgrade the device to the newest release for `product`
    ///
    /// Re-running against a device that already has the release version is a
    /// no-op returning [`UpgradeOutcome::UpToDate`].
    #[instrument(skip(self))]
    pub async fn run(&self, product: ProductType) -> Result<UpgradeOutcome, UpgradeError> {
        let descriptor = self.locator.locate(product).await.inspect_err(|e| {
            error!("No image to upgrade to: {}", e);
        })?;

        let before = self.session.get_state().await.inspect_err(|e| {
            error!("Could not read the installed version: {}", e);
        })?;
        match before.software_version.as_deref() {
            Some(installed) if installed == descriptor.version => {
                info!("Software versions are the same ({}); no upgrade needed", installed);
                return Ok(UpgradeOutcome::UpToDate {
                    version: descriptor.version,
                });
            }
            Some(installed) => info!(
                "Different versions. Current version = {}. Image version = {}",
                installed, descriptor.version
            ),
            None => warn!(
                "Device did not report its version; upgrading to {}",
                descriptor.version
            ),
        }

        if let Err(e) = self.deliver(&descriptor).await {
            error!(last_state = %before, "Upgrade to {} aborted: {}", descriptor.version, e);
            return Err(e);
        }

        self.poller
            .settle("the device to install the image and reboot", self.settle)
            .await;

        self.await_version(&descriptor.version).await
    }

    async fn deliver(&self, descriptor: &ImageDescriptor) -> Result<(), UpgradeError> {
        match Delivery::for_product(descriptor.product) {
            Delivery::Push => {
                let local = self.locator.fetch(descriptor, &self.download_dir).await?;
                let result = self.session.install_image(&local).await;
                if let Err(e) = local.remove() {
                    warn!("Could not delete downloaded image files: {}", e);
                }
                result?;
                info!("Uploaded {} and {}", descriptor.name, descriptor.auth_name);
            }
            Delivery::Pull => {
                self.session.pull_image(descriptor, self.locator.server()).await?;
            }
        }
        Ok(())
    }

    async fn await_version(&self, target: &str) -> Result<UpgradeOutcome, UpgradeError> {
        let outcome = self
            .poller
            .poll_until(
                "software version",
                self.version_policy,
                || self.monitor.get_state(),
                |state| version_verdict(state, target),
            )
            .await
            .inspect_err(|e| error!("Polling the version after upgrade failed: {}", e))?;

        match outcome {
            PollOutcome::Converged { .. } => info!("Device reports version {}", target),
            PollOutcome::TimedOut { last_state, attempts } => {
                let reason = format!(
                    "device did not report version {} within {} attempts",
                    target, attempts
                );
                error!(last_state = ?last_state, "Failed to upgrade: {}", reason);
                return Ok(UpgradeOutcome::FailedConverge { reason, last_state });
            }
            PollOutcome::Diverged { state, reason, .. } => {
                error!(last_state = %state, "Failed to upgrade: {}", reason);
                return Ok(UpgradeOutcome::FailedConverge {
                    reason,
                    last_state: Some(state),
                });
            }
        }

        match await_reboot_recovery(
            self.monitor.as_ref(),
            &self.poller,
            self.reboot_policy,
            Duration::ZERO,
        )
        .await?
        {
            PollOutcome::Converged { state, .. } => Ok(UpgradeOutcome::Upgraded {
                version: target.to_string(),
                state,
            }),
            other => {
                let reason = format!("device did not recover after the upgrade ({})", other);
                let last_state = other.into_last_state();
                error!(last_state = ?last_state, "Failed to upgrade: {}", reason);
                Ok(UpgradeOutcome::FailedConverge { reason, last_state })
            }
        }
    }
}

/// `Satisfied` on the target version, `DefinitelyFailed` on any other
/// reported version, `NotYetSatisfied` while the version is unknown
pub fn version_verdict(state: &DeviceState, target: &str) -> Verdict {
    match state.software_version.as_deref() {
        Some(version) if version == target => Verdict::Satisfied,
        Some(version) => Verdict::DefinitelyFailed(format!(
            "device reports version {}, expected {}",
            version, target
        )),
        None => Verdict::NotYetSatisfied,
    }
}

/// Wait `settle`, then poll until the session sees a booted device
/// ([`DeviceSession::is_recovered`])
#[instrument(skip(session, poller))]
pub async fn await_reboot_recovery(
    session: &dyn DeviceSession,
    poller: &ConvergencePoller,
    policy: PollPolicy,
    settle: Duration,
) -> Result<PollOutcome<DeviceState>, DeviceError> {
    poller.settle("the device to reboot", settle).await;
    let outcome = poller
        .poll_until(
            "reboot recovery",
            policy,
            || session.get_state(),
            |state| {
                if session.is_recovered(state) {
                    Verdict::Satisfied
                } else {
                    Verdict::NotYetSatisfied
                }
            },
        )
        .await?;
    if let PollOutcome::Converged { state, .. } = &outcome {
        info!("Device is back up: {}", state);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ReleaseServer;
    use crate::session::{ShellOptions, ShellSession};
    use crate::testing::{FakeShell, RecordingSleeper, ScriptedRunner, ScriptedSession};
    use k2_core::SyncState;
    use pretty_assertions::assert_eq;

    const K2_LISTING: &str = "SyncServer6x0_v5.1.2.7.bin\n5.1.2.7_auth.dat\n";

    struct Fixture {
        session: Arc<ScriptedSession>,
        runner: Arc<ScriptedRunner>,
        sleeper: Arc<RecordingSleeper>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(states: Vec<crate::error::Result<DeviceState>>) -> Self {
            Self::with_session(ScriptedSession::with_states(states))
        }

        fn with_session(session: ScriptedSession) -> Self {
            let runner = Arc::new(ScriptedRunner::with_responses(vec![
                Ok("2021_09_14_sdk\n".into()),
                Ok(K2_LISTING.into()),
            ]));
            Self {
                session: Arc::new(session),
                runner,
                sleeper: Arc::new(RecordingSleeper::new()),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        /// Files scp would have written
        fn stage_download(&self) {
            std::fs::write(self.dir.path().join("SyncServer6x0_v5.1.2.7.bin"), b"image").unwrap();
            std::fs::write(self.dir.path().join("5.1.2.7_auth.dat"), b"auth").unwrap();
        }

        fn orchestrator(&self) -> UpgradeOrchestrator {
            let server = ReleaseServer {
                host: "10.0.0.5".into(),
                user: "builder".into(),
                password: None,
                path: "/builds".into(),
            };
            let locator = ImageLocator::new(server, self.runner.clone());
            UpgradeOrchestrator::new(self.session.clone(), locator)
                .with_poller(ConvergencePoller::new(self.sleeper.clone()))
                .with_download_dir(self.dir.path())
        }

        fn image_left_behind(&self) -> bool {
            self.dir.path().join("SyncServer6x0_v5.1.2.7.bin").exists()
                || self.dir.path().join("5.1.2.7_auth.dat").exists()
        }
    }

    fn version(v: &str) -> crate::error::Result<DeviceState> {
        Ok(DeviceState::reachable().with_version(v))
    }

    fn recovered(v: &str) -> crate::error::Result<DeviceState> {
        Ok(DeviceState::reachable()
            .with_version(v)
            .with_sync_state(SyncState::Freerun))
    }

    #[tokio::test]
    async fn test_same_version_is_up_to_date_without_transfer() {
        let fixture = Fixture::new(vec![version("5.1.2.7")]);

        let outcome = fixture.orchestrator().run(ProductType::K2).await.unwrap();

        assert_eq!(outcome, UpgradeOutcome::UpToDate { version: "5.1.2.7".into() });
        assert!(fixture.session.installs().is_empty());
        // two listings, no scp
        assert_eq!(fixture.runner.executed_commands().len(), 2);
        assert_eq!(fixture.sleeper.count(), 0);
    }

    #[tokio::test]
    async fn test_push_upgrade_converges() {
        let fixture = Fixture::new(vec![
            version("5.1.2.6"),
            Err(DeviceError::ConnectionFailed("rebooting".into())),
            version("5.1.2.7"),
            recovered("5.1.2.7"),
        ]);
        fixture.stage_download();

        let outcome = fixture.orchestrator().run(ProductType::K2).await.unwrap();

        match outcome {
            UpgradeOutcome::Upgraded { version, state } => {
                assert_eq!(version, "5.1.2.7");
                assert_eq!(state.sync_state, Some(SyncState::Freerun));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fixture.session.installs(), vec!["SyncServer6x0_v5.1.2.7.bin".to_string()]);
        assert!(!fixture.image_left_behind());
        // settle, then one retry after the connection failure
        assert_eq!(
            fixture.sleeper.durations(),
            vec![Duration::from_secs(360), Duration::from_secs(60)]
        );
    }

    #[tokio::test]
    async fn test_wrong_version_fails_fast() {
        let fixture = Fixture::new(vec![version("5.1.2.6"), version("5.1.2.6")]);
        fixture.stage_download();

        let outcome = fixture.orchestrator().run(ProductType::K2).await.unwrap();

        match outcome {
            UpgradeOutcome::FailedConverge { reason, last_state } => {
                assert!(reason.contains("5.1.2.6"));
                assert_eq!(last_state.unwrap().software_version.as_deref(), Some("5.1.2.6"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fixture.session.state_reads(), 2);
        assert_eq!(fixture.sleeper.count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_after_upgrade_times_out() {
        let fixture = Fixture::new(vec![version("5.1.2.6")]);
        fixture.stage_download();

        let outcome = fixture.orchestrator().run(ProductType::K2).await.unwrap();

        assert_eq!(
            outcome,
            UpgradeOutcome::FailedConverge {
                reason: "device did not report version 5.1.2.7 within 10 attempts".into(),
                last_state: None,
            }
        );
        // initial read plus the full budget
        assert_eq!(fixture.session.state_reads(), 11);
        assert_eq!(fixture.sleeper.count(), 1 + 9);
    }

    #[tokio::test]
    async fn test_failed_upload_still_deletes_local_files() {
        let fixture =
            Fixture::with_session(ScriptedSession::with_states(vec![version("5.1.2.6")]).failing_install(500));
        fixture.stage_download();

        let err = fixture.orchestrator().run(ProductType::K2).await.unwrap_err();

        assert!(matches!(
            err,
            UpgradeError::Device(DeviceError::HttpStatus { status: 500, .. })
        ));
        assert!(!fixture.image_left_behind());
        assert_eq!(fixture.sleeper.count(), 0);
    }

    #[tokio::test]
    async fn test_missing_image_aborts_before_device_access() {
        let fixture = Fixture::new(vec![version("5.1.2.6")]);
        let runner = Arc::new(ScriptedRunner::with_responses(vec![
            Ok("2021_09_14_sdk\n".into()),
            Ok("README\n".into()),
        ]));
        let locator = ImageLocator::new(
            ReleaseServer {
                host: "10.0.0.5".into(),
                user: "builder".into(),
                password: None,
                path: "/builds".into(),
            },
            runner,
        );
        let orchestrator = UpgradeOrchestrator::new(fixture.session.clone(), locator)
            .with_poller(ConvergencePoller::new(fixture.sleeper.clone()));

        let err = orchestrator.run(ProductType::K2).await.unwrap_err();

        assert!(matches!(err, UpgradeError::Image(ImageError::ImageNotFound { .. })));
        assert_eq!(fixture.session.state_reads(), 0);
    }

    #[tokio::test]
    async fn test_tp4100_is_pulled_by_the_device() {
        let session = Arc::new(ScriptedSession::with_states(vec![
            version("2.3.1.12"),
            version("2.4.0.1"),
            recovered("2.4.0.1"),
        ]));
        let runner = Arc::new(ScriptedRunner::with_responses(vec![
            Ok("2021_09_14_sdk\n".into()),
            Ok("TimeProvider4100_v2.4.0.bin\n2.4.0.1_auth.dat\n".into()),
        ]));
        let sleeper = Arc::new(RecordingSleeper::new());
        let locator = ImageLocator::new(
            ReleaseServer {
                host: "10.0.0.5".into(),
                user: "builder".into(),
                password: None,
                path: "/builds".into(),
            },
            runner.clone(),
        );

        let outcome = UpgradeOrchestrator::new(session.clone(), locator)
            .with_poller(ConvergencePoller::new(sleeper))
            .run(ProductType::Tp4100)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(session.pulls(), vec!["TimeProvider4100_v2.4.0.bin".to_string()]);
        assert!(session.installs().is_empty());
        assert!(runner.executed_commands().iter().all(|c| !c.starts_with("scp")));
    }

    #[tokio::test]
    async fn test_tp4100_recovers_through_shell_monitor() {
        let session = Arc::new(ScriptedSession::with_states(vec![version("2.3.1.12")]));
        let (stream, received) = FakeShell::new("TimeProvider>")
            .on("show system", "Serial Num : 42\nBuild      : 2.4.0.1")
            .spawn();
        let monitor = ShellSession::from_stream(
            "dut",
            stream,
            ShellOptions {
                prompt: "TimeProvider>".into(),
                timeout: Duration::from_secs(2),
                ..ShellOptions::default()
            },
        )
        .await
        .unwrap();
        let runner = Arc::new(ScriptedRunner::with_responses(vec![
            Ok("2021_09_14_sdk\n".into()),
            Ok("TimeProvider4100_v2.4.0.bin\n2.4.0.1_auth.dat\n".into()),
        ]));
        let sleeper = Arc::new(RecordingSleeper::new());
        let locator = ImageLocator::new(
            ReleaseServer {
                host: "10.0.0.5".into(),
                user: "builder".into(),
                password: None,
                path: "/builds".into(),
            },
            runner,
        );

        let outcome = UpgradeOrchestrator::new(session.clone(), locator)
            .with_monitor(Arc::new(monitor))
            .with_poller(ConvergencePoller::new(sleeper.clone()))
            .run(ProductType::Tp4100)
            .await
            .unwrap();

        match outcome {
            UpgradeOutcome::Upgraded { version, state } => {
                assert_eq!(version, "2.4.0.1");
                assert_eq!(state.sync_state, None);
                assert_eq!(state.software_version.as_deref(), Some("2.4.0.1"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(session.pulls(), vec!["TimeProvider4100_v2.4.0.bin".to_string()]);
        // version check and recovery each answered on the first read
        assert_eq!(received.lock().clone(), vec!["show system".to_string(); 2]);
        assert_eq!(sleeper.durations(), vec![Duration::from_secs(360)]);
    }

    #[tokio::test]
    async fn test_shell_snapshot_without_version_is_not_recovered() {
        let (stream, _) = FakeShell::new("SyncServer>")
            .on("show system", "Serial Num : 42")
            .on("show image", "no image information")
            .spawn();
        let shell = ShellSession::from_stream(
            "dut",
            stream,
            ShellOptions {
                timeout: Duration::from_secs(2),
                ..ShellOptions::default()
            },
        )
        .await
        .unwrap();
        let sleeper = Arc::new(RecordingSleeper::new());

        let outcome = await_reboot_recovery(
            &shell,
            &ConvergencePoller::new(sleeper.clone()),
            PollPolicy::new(3, Duration::from_secs(5)),
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert!(!outcome.is_converged());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(sleeper.count(), 2);
    }

    #[tokio::test]
    async fn test_reboot_recovery_polls_until_sync_state() {
        let session = ScriptedSession::with_states(vec![
            Err(DeviceError::Timeout),
            Ok(DeviceState::reachable()),
            recovered("5.1.2.7"),
        ]);
        let sleeper = Arc::new(RecordingSleeper::new());
        let poller = ConvergencePoller::new(sleeper.clone());

        let outcome = await_reboot_recovery(
            &session,
            &poller,
            PollPolicy::reboot(),
            Duration::from_secs(360),
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempts(), 3);
        assert!(outcome.is_converged());
        assert_eq!(
            sleeper.durations(),
            vec![
                Duration::from_secs(360),
                Duration::from_secs(5),
                Duration::from_secs(5)
            ]
        );
    }

    #[test]
    fn test_version_verdict() {
        let unknown = DeviceState::reachable();
        assert_eq!(version_verdict(&unknown, "5.1.2.7"), Verdict::NotYetSatisfied);
        let right = DeviceState::reachable().with_version("5.1.2.7");
        assert_eq!(version_verdict(&right, "5.1.2.7"), Verdict::Satisfied);
        let wrong = DeviceState::reachable().with_version("5.1.2.6");
        assert!(matches!(version_verdict(&wrong, "5.1.2.7"), Verdict::DefinitelyFailed(_)));
    }
}
