//! K2 Client Library
//!
//! Drives K2 (SyncServer) and TimeProvider 4100 timing appliances through
//! their REST API and CLI: firmware upgrades, reference switching and the
//! bounded polling both rely on to wait for the device.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use k2_client::{HarnessConfig, ImageLocator, RestSession, UpgradeOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HarnessConfig::from_yaml_file("harness.yaml")?;
//!     let session = Arc::new(RestSession::connect(&config.device, &config.timeouts).await?);
//!
//!     let locator = ImageLocator::with_process_runner(config.releases.server());
//!     let outcome = UpgradeOrchestrator::new(session, locator)
//!         .with_policies(&config.polling, &config.settle)
//!         .run(config.releases.product)
//!         .await?;
//!     println!("{:?}", outcome);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Switching references
//!
//! ```rust,ignore
//! let switcher = ReferenceSwitcher::new(session, ApiGeneration::V2);
//! let report = switcher.apply_and_await_lock("PTP").await?;
//! println!("{}", report.summary());
//! ```
//!
//! # Testing
//!
//! The `testing` module provides a mock device and deterministic sleepers:
//!
//! ```rust,ignore
//! use k2_client::testing::{MockDevice, TestServer};
//!
//! let device = MockDevice::new().upgrades_to("5.1.3.0", 2);
//! let server = TestServer::start(device.router()).await?;
//! let session = server.session(ApiGeneration::V2)?;
//! ```

pub mod config;
pub mod device;
mod error;
pub mod image;
pub mod poll;
pub mod reference;
pub mod runner;
pub mod session;
pub mod testing;
pub mod upgrade;

pub use config::{ConfigError, HarnessConfig};
pub use device::K2Device;
pub use error::{DeviceError, Result};
pub use image::{ImageError, ImageLocator, ReleaseServer};
pub use poll::{ConvergencePoller, PollOutcome, PollPolicy, Sleeper, TokioSleeper, Transient, Verdict};
pub use reference::{LockReport, ReferenceSwitcher, SwapPlan, SwitchError};
pub use runner::{CommandRunner, ProcessRunner};
pub use session::{DeviceSession, RestSession, ShellOptions, ShellProbe, ShellSession};
pub use upgrade::{UpgradeError, UpgradeOrchestrator, UpgradeOutcome};

// Re-export core types for convenience
pub use k2_core::{
    ApiGeneration, DeviceState, ImageDescriptor, ProductType, ReferenceSource, SyncState,
    TimeSource,
};
