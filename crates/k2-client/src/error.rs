//! Error types for device operations

use k2_core::ModelError;
use thiserror::Error;

/// Result type alias for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors that can occur while talking to a device
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Device unreachable (refused, reset, DNS, TLS handshake...)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request or prompt wait exceeded its deadline
    #[error("Request timed out")]
    Timeout,

    /// Device answered with a non-2xx status
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shell command or child process failed
    #[error("Command failed: {0}")]
    Command(String),

    /// Transport cannot perform this operation
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Device data outside the known enumerations
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Any other HTTP client failure
    #[error("HTTP client error: {0}")]
    Http(reqwest::Error),
}

impl DeviceError {
    /// Create an HTTP status error from status code and message
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            message: message.into(),
        }
    }

    /// Whether waiting and asking again may succeed
    ///
    /// Connection failures and timeouts happen while a device reboots; 503 is
    /// what the web server answers while the API is still starting.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Timeout => true,
            Self::HttpStatus { status, .. } => *status == 503,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() || e.is_request() {
            Self::ConnectionFailed(e.to_string())
        } else if e.is_decode() {
            Self::Parse(e.to_string())
        } else if let Some(status) = e.status() {
            Self::http_status(status.as_u16(), e.to_string())
        } else {
            Self::Http(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DeviceError::Timeout.is_transient());
        assert!(DeviceError::ConnectionFailed("refused".into()).is_transient());
        assert!(DeviceError::http_status(503, "starting").is_transient());
        assert!(!DeviceError::http_status(500, "boom").is_transient());
        assert!(!DeviceError::http_status(401, "auth").is_transient());
        assert!(!DeviceError::Parse("bad json".into()).is_transient());
    }
}
