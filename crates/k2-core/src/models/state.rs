//! Device state snapshots

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ReferenceSource, SyncState};

/// Whether the device answered when the snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    #[default]
    Reachable,
    Unreachable,
}

/// Snapshot of the device state at one point in time
///
/// Fields the device did not report (or reported with an unknown code) are
/// `None`. A snapshot is never updated in place; the next poll produces a new
/// one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub sync_state: Option<SyncState>,
    pub current_reference: Option<ReferenceSource>,
    pub software_version: Option<String>,
    pub oscillator: Option<String>,
    pub connectivity: Connectivity,
    pub captured_at: DateTime<Utc>,
}

impl DeviceState {
    /// Empty snapshot of a reachable device, stamped now
    pub fn reachable() -> Self {
        Self {
            sync_state: None,
            current_reference: None,
            software_version: None,
            oscillator: None,
            connectivity: Connectivity::Reachable,
            captured_at: Utc::now(),
        }
    }

    pub fn with_sync_state(mut self, state: SyncState) -> Self {
        self.sync_state = Some(state);
        self
    }

    pub fn with_reference(mut self, reference: ReferenceSource) -> Self {
        self.current_reference = Some(reference);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = Some(version.into());
        self
    }

    /// Fill sync state and current reference from a `/system/state` record
    pub fn apply_state_record(mut self, record: &Value) -> Self {
        self.sync_state = code_field(record, "syncState").and_then(SyncState::from_code);
        self.current_reference = code_field(record, "currRef").and_then(ReferenceSource::from_code);
        self
    }

    /// Fill software version and oscillator from a `/system/inventory` record
    pub fn apply_inventory_record(mut self, record: &Value) -> Self {
        self.software_version = record
            .get("softwareVer")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self.oscillator = record
            .pointer("/inventory/oscillator")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self
    }

    pub fn is_reachable(&self) -> bool {
        self.connectivity == Connectivity::Reachable
    }

    /// Locked, and following the given reference
    pub fn is_locked_to(&self, reference: ReferenceSource) -> bool {
        self.sync_state == Some(SyncState::Locked) && self.current_reference == Some(reference)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_unknown<T: fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".into())
        }

        write!(
            f,
            "sync state = {}, reference = {}, version = {}",
            or_unknown(&self.sync_state),
            or_unknown(&self.current_reference),
            or_unknown(&self.software_version),
        )
    }
}

/// Read an integer code that the API sends either as a number or a string
fn code_field(record: &Value, field: &str) -> Option<u8> {
    match record.get(field)? {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
