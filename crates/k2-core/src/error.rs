//! Error types for model conversions

use thiserror::Error;

/// Result type for model conversions
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised when device data does not map onto a known value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Numeric code outside the enumeration
    #[error("Unknown {kind} code: {code}")]
    UnknownCode { kind: &'static str, code: i64 },

    /// Label outside the enumeration
    #[error("Unknown {kind}: {label}")]
    UnknownLabel { kind: &'static str, label: String },

    /// Field missing or malformed in a device record
    #[error("Invalid field {field}: {message}")]
    InvalidField { field: &'static str, message: String },
}

impl ModelError {
    pub(crate) fn unknown_code(kind: &'static str, code: impl Into<i64>) -> Self {
        Self::UnknownCode {
            kind,
            code: code.into(),
        }
    }

    pub(crate) fn unknown_label(kind: &'static str, label: impl Into<String>) -> Self {
        Self::UnknownLabel {
            kind,
            label: label.into(),
        }
    }
}
