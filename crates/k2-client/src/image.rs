//! Firmware image discovery and download
//!
//! Releases live on a build server in dated folders:
//!
//! ```text
//! /builds/
//!   2021_09_07_sdk/
//!   2021_09_14_sdk/
//!     SyncServer6x0_v5.1.2.7.bin
//!     5.1.2.7_auth.dat
//! ```
//!
//! The newest folder by name is the release under test. It must contain
//! exactly one binary for the product and exactly one authorization file.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use chrono::NaiveDate;
use k2_core::{ImageDescriptor, LocalImage, ProductType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::error::DeviceError;
use crate::runner::{CommandRunner, ProcessRunner};

static RELEASE_FOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}_\d{2}_\d{2}_sdk$").expect("valid regex"));

static AUTH_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+\.\d+_auth\.dat$").expect("valid regex"));

static EMBEDDED_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)+").expect("valid regex"));

/// Errors from locating or fetching an image
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("No {product} image found: {reason}")]
    ImageNotFound { product: ProductType, reason: String },

    #[error("Ambiguous {product} image in {folder}: {reason}")]
    AmbiguousImage {
        product: ProductType,
        folder: String,
        reason: String,
    },

    #[error("Image transfer failed: {0}")]
    Transfer(String),

    #[error(transparent)]
    Command(#[from] DeviceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build server holding the release folders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseServer {
    pub host: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Directory containing the dated release folders
    pub path: String,
}

impl ReleaseServer {
    /// Absolute path of a file inside a release folder
    pub fn remote_path(&self, folder: &str, file: &str) -> String {
        format!("{}/{}/{}", self.path.trim_end_matches('/'), folder, file)
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Finds the newest release image and copies it to the local machine
pub struct ImageLocator {
    server: ReleaseServer,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for ImageLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLocator")
            .field("server", &self.server.target())
            .finish_non_exhaustive()
    }
}

impl ImageLocator {
    pub fn new(server: ReleaseServer, runner: Arc<dyn CommandRunner>) -> Self {
        Self { server, runner }
    }

    /// Locator that runs `ssh`/`scp`, with the server password (if any)
    /// supplied through sshpass
    pub fn with_process_runner(server: ReleaseServer) -> Self {
        let runner = Arc::new(ProcessRunner::new(server.password.clone()));
        Self::new(server, runner)
    }

    pub fn server(&self) -> &ReleaseServer {
        &self.server
    }

    async fn list(&self, dir: &str) -> Result<String, ImageError> {
        let args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            self.server.target(),
            format!("ls -1 {}", dir),
        ];
        Ok(self.runner.run("ssh", &args).await?)
    }

    /// Resolve the image and authorization file for `product` in the newest
    /// release folder
    #[instrument(skip(self), fields(server = %self.server.host))]
    pub async fn locate(&self, product: ProductType) -> Result<ImageDescriptor, ImageError> {
        let root = self.list(&self.server.path).await?;
        let folder = newest_release_folder(&root).ok_or_else(|| ImageError::ImageNotFound {
            product,
            reason: format!("no YYYY_MM_DD_sdk folder under {}", self.server.path),
        })?;

        let folder_path = format!("{}/{}", self.server.path.trim_end_matches('/'), folder);
        let listing = self.list(&folder_path).await?;
        let descriptor = select_image(product, &folder, &listing)?;
        info!(
            "Found {} (auth {}, version {}) in {}",
            descriptor.name, descriptor.auth_name, descriptor.version, folder
        );
        Ok(descriptor)
    }

    /// Copy the image and authorization file into `dest`
    #[instrument(skip(self, descriptor, dest), fields(image = %descriptor.name))]
    pub async fn fetch(
        &self,
        descriptor: &ImageDescriptor,
        dest: &Path,
    ) -> Result<LocalImage, ImageError> {
        let target = self.server.target();
        let args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            format!("{}:{}", target, self.server.remote_path(&descriptor.folder, &descriptor.name)),
            format!(
                "{}:{}",
                target,
                self.server.remote_path(&descriptor.folder, &descriptor.auth_name)
            ),
            dest.display().to_string(),
        ];
        self.runner.run("scp", &args).await?;

        let local = LocalImage {
            descriptor: descriptor.clone(),
            image_path: dest.join(&descriptor.name),
            auth_path: dest.join(&descriptor.auth_name),
        };
        if !local.local_path_valid() {
            warn!("scp finished but {} is incomplete", dest.display());
            local.remove()?;
            return Err(ImageError::Transfer(format!(
                "{} or {} missing in {}",
                descriptor.name,
                descriptor.auth_name,
                dest.display()
            )));
        }
        info!("Fetched {} to {}", descriptor.name, dest.display());
        Ok(local)
    }
}

/// Greatest `YYYY_MM_DD_sdk` entry of an `ls -1` listing
///
/// Names with an impossible date are skipped.
pub fn newest_release_folder(listing: &str) -> Option<String> {
    listing
        .lines()
        .map(|line| line.trim().trim_end_matches('/'))
        .filter(|name| RELEASE_FOLDER.is_match(name))
        .filter(|name| NaiveDate::parse_from_str(&name[..10], "%Y_%m_%d").is_ok())
        .max()
        .map(str::to_owned)
}

/// Pick the binary and authorization file for `product` out of a folder listing
pub fn select_image(
    product: ProductType,
    folder: &str,
    listing: &str,
) -> Result<ImageDescriptor, ImageError> {
    let pattern = format!("^{}$", product.image_pattern());
    let binary_re = Regex::new(&pattern).map_err(|e| ImageError::Transfer(e.to_string()))?;

    let names: Vec<&str> = listing.lines().map(str::trim).collect();
    let binaries: Vec<&str> = names.iter().copied().filter(|n| binary_re.is_match(n)).collect();
    let auths: Vec<&str> = names.iter().copied().filter(|n| AUTH_FILE.is_match(n)).collect();

    let ambiguous = |reason: String| ImageError::AmbiguousImage {
        product,
        folder: folder.to_string(),
        reason,
    };

    let name = match binaries.as_slice() {
        [] => {
            return Err(ImageError::ImageNotFound {
                product,
                reason: format!("no file matching {} in {}", product.image_pattern(), folder),
            })
        }
        [one] => *one,
        many => return Err(ambiguous(format!("{} binaries: {}", many.len(), many.join(", ")))),
    };

    let auth_name = match auths.as_slice() {
        [] => {
            return Err(ImageError::ImageNotFound {
                product,
                reason: format!("no authorization file in {}", folder),
            })
        }
        [one] => *one,
        many => {
            return Err(ambiguous(format!(
                "{} authorization files: {}",
                many.len(),
                many.join(", ")
            )))
        }
    };

    let version = ImageDescriptor::version_from_auth_name(auth_name)
        .ok_or_else(|| ambiguous(format!("no version in {}", auth_name)))?
        .to_string();

    if let Some(embedded) = EMBEDDED_VERSION.find(name).map(|m| m.as_str()) {
        let consistent = version == embedded || version.starts_with(&format!("{}.", embedded));
        if !consistent {
            return Err(ambiguous(format!(
                "{} is version {} but {} is version {}",
                name, embedded, auth_name, version
            )));
        }
    }

    Ok(ImageDescriptor {
        product,
        folder: folder.to_string(),
        name: name.to_string(),
        auth_name: auth_name.to_string(),
        version,
    })
}
