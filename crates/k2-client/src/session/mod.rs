//! Device sessions
//!
//! A [`DeviceSession`] executes single request/response interactions against
//! one device. Two transports exist:
//!
//! - [`RestSession`]: the HTTPS management API (`/api/v1` or `/api/v2`)
//! - [`ShellSession`]: the interactive CLI over SSH
//!
//! Sessions are used by one flow at a time. Each method completes its
//! request before returning; nothing is pipelined.

mod parse;
mod rest;
mod shell;

pub use parse::*;
pub use rest::RestSession;
pub use shell::{ShellOptions, ShellProbe, ShellSession};

use async_trait::async_trait;
use k2_core::{DeviceState, ImageDescriptor, LocalImage};
use serde_json::Value;

use crate::error::{DeviceError, Result};
use crate::image::ReleaseServer;

/// The operations the harness needs from a device connection
///
/// Transports leave the default implementations for operations they cannot
/// perform; those return [`DeviceError::Unsupported`].
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Capture a fresh state snapshot
    async fn get_state(&self) -> Result<DeviceState>;

    /// Whether a snapshot read over this transport shows a device that has
    /// finished booting
    ///
    /// The REST API reports a sync state once the timing services are up.
    fn is_recovered(&self, state: &DeviceState) -> bool {
        state.sync_state.is_some()
    }

    /// GET a JSON resource
    async fn get_resource(&self, path: &str) -> Result<Value> {
        let _ = path;
        Err(DeviceError::Unsupported("get_resource".to_string()))
    }

    /// PUT a JSON body, returning the HTTP status
    async fn put_resource(&self, path: &str, body: &Value) -> Result<u16> {
        let _ = (path, body);
        Err(DeviceError::Unsupported("put_resource".to_string()))
    }

    /// POST a JSON body, returning the HTTP status
    async fn post_resource(&self, path: &str, body: &Value) -> Result<u16> {
        let _ = (path, body);
        Err(DeviceError::Unsupported("post_resource".to_string()))
    }

    /// DELETE a resource, returning the HTTP status
    async fn delete_resource(&self, path: &str) -> Result<u16> {
        let _ = path;
        Err(DeviceError::Unsupported("delete_resource".to_string()))
    }

    /// Run one CLI command and return its output (interactive transports only)
    async fn send_command(&self, command: &str) -> Result<String> {
        let _ = command;
        Err(DeviceError::Unsupported("send_command".to_string()))
    }

    /// Push local image and authorization files to the device's upgrade endpoint
    async fn install_image(&self, image: &LocalImage) -> Result<()> {
        let _ = image;
        Err(DeviceError::Unsupported("install_image".to_string()))
    }

    /// Have the device fetch an image from the release server itself
    async fn pull_image(&self, descriptor: &ImageDescriptor, server: &ReleaseServer) -> Result<()> {
        let _ = (descriptor, server);
        Err(DeviceError::Unsupported("pull_image".to_string()))
    }
}
