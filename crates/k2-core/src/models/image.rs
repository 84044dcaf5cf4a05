//! Firmware image models

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Appliance family, which selects the release image naming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    K2,
    Tp4100,
}

impl ProductType {
    /// Pattern for the binary image in a release folder listing
    pub fn image_pattern(self) -> &'static str {
        match self {
            Self::K2 => r"SyncServer6x0_v5\S*\.bin",
            Self::Tp4100 => r"TimeProvider4100_v\S*\.bin",
        }
    }

    /// Prompt printed by the device CLI
    pub fn default_prompt(self) -> &'static str {
        match self {
            Self::K2 => "SyncServer>",
            Self::Tp4100 => "TimeProvider>",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::K2 => "k2",
            Self::Tp4100 => "tp4100",
        }
    }
}

impl FromStr for ProductType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "k2" => Ok(Self::K2),
            "tp4100" => Ok(Self::Tp4100),
            other => Err(ModelError::unknown_label("product type", other)),
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A firmware image located in a release folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub product: ProductType,
    /// Release folder the image was found in (e.g. `2021_09_14_sdk`)
    pub folder: String,
    /// Binary image filename
    pub name: String,
    /// Authorization artifact filename
    pub auth_name: String,
    /// Version taken from the authorization artifact name
    pub version: String,
}

impl ImageDescriptor {
    /// Version prefix of an authorization artifact name (`5.1.2.7_auth.dat` → `5.1.2.7`)
    pub fn version_from_auth_name(auth_name: &str) -> Option<&str> {
        auth_name
            .split_once('_')
            .map(|(version, _)| version)
            .filter(|version| !version.is_empty())
    }
}

/// Image files copied to the local machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    pub descriptor: ImageDescriptor,
    pub image_path: PathBuf,
    pub auth_path: PathBuf,
}

impl LocalImage {
    /// Both files exist on disk
    pub fn local_path_valid(&self) -> bool {
        self.image_path.is_file() && self.auth_path.is_file()
    }

    /// Delete both local files; missing files are not an error
    pub fn remove(&self) -> std::io::Result<()> {
        for path in [&self.image_path, &self.auth_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_type_is_exact() {
        assert_eq!("tp4100".parse::<ProductType>().unwrap(), ProductType::Tp4100);
        assert_eq!("K2".parse::<ProductType>().unwrap(), ProductType::K2);
        assert!("tp4100v2".parse::<ProductType>().is_err());
        assert!("".parse::<ProductType>().is_err());
    }

    #[test]
    fn test_version_from_auth_name() {
        assert_eq!(
            ImageDescriptor::version_from_auth_name("5.1.2.7_auth.dat"),
            Some("5.1.2.7")
        );
        assert_eq!(ImageDescriptor::version_from_auth_name("_auth.dat"), None);
        assert_eq!(ImageDescriptor::version_from_auth_name("auth.dat"), None);
    }

    #[test]
    fn test_remove_tolerates_missing_files() {
        let image = LocalImage {
            descriptor: ImageDescriptor {
                product: ProductType::K2,
                folder: "2021_01_01_sdk".into(),
                name: "a.bin".into(),
                auth_name: "1.0.0.0_auth.dat".into(),
                version: "1.0.0.0".into(),
            },
            image_path: PathBuf::from("/nonexistent/a.bin"),
            auth_path: PathBuf::from("/nonexistent/1.0.0.0_auth.dat"),
        };
        assert!(!image.local_path_valid());
        assert!(image.remove().is_ok());
    }
}
