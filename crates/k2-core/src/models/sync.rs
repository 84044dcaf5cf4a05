//! Clock synchronization state reported in `/system/state`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Timing subsystem state (`syncState`)
///
/// The `-M` variants are the device's "manual" flavours of the base states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SyncState {
    Warmup,
    Freerun,
    Handset,
    Locking,
    Locked,
    Bridging,
    Holdover,
    HoldoverExpired,
    Recovering,
    HandsetM,
    LockedM,
    HoldoverM,
}

impl SyncState {
    pub const ALL: [SyncState; 12] = [
        Self::Warmup,
        Self::Freerun,
        Self::Handset,
        Self::Locking,
        Self::Locked,
        Self::Bridging,
        Self::Holdover,
        Self::HoldoverExpired,
        Self::Recovering,
        Self::HandsetM,
        Self::LockedM,
        Self::HoldoverM,
    ];

    /// Look up a state by its API code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Warmup),
            1 => Some(Self::Freerun),
            2 => Some(Self::Handset),
            3 => Some(Self::Locking),
            4 => Some(Self::Locked),
            5 => Some(Self::Bridging),
            6 => Some(Self::Holdover),
            7 => Some(Self::HoldoverExpired),
            8 => Some(Self::Recovering),
            9 => Some(Self::HandsetM),
            10 => Some(Self::LockedM),
            11 => Some(Self::HoldoverM),
            _ => None,
        }
    }

    /// API code for this state
    pub fn code(self) -> u8 {
        match self {
            Self::Warmup => 0,
            Self::Freerun => 1,
            Self::Handset => 2,
            Self::Locking => 3,
            Self::Locked => 4,
            Self::Bridging => 5,
            Self::Holdover => 6,
            Self::HoldoverExpired => 7,
            Self::Recovering => 8,
            Self::HandsetM => 9,
            Self::LockedM => 10,
            Self::HoldoverM => 11,
        }
    }

    /// Label as shown in the device web UI
    pub fn label(self) -> &'static str {
        match self {
            Self::Warmup => "Warmup",
            Self::Freerun => "Freerun",
            Self::Handset => "Handset",
            Self::Locking => "Locking",
            Self::Locked => "Locked",
            Self::Bridging => "Bridging",
            Self::Holdover => "Holdover",
            Self::HoldoverExpired => "Holdover expired",
            Self::Recovering => "Recovering",
            Self::HandsetM => "Handset -M",
            Self::LockedM => "Locked - M",
            Self::HoldoverM => "Holdover - M",
        }
    }

    /// Whether the device is running on its internal oscillator
    pub fn is_holdover(self) -> bool {
        matches!(
            self,
            Self::Holdover | Self::HoldoverExpired | Self::HoldoverM
        )
    }
}

impl TryFrom<u8> for SyncState {
    type Error = ModelError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| ModelError::unknown_code("sync state", code))
    }
}

impl From<SyncState> for u8 {
    fn from(state: SyncState) -> Self {
        state.code()
    }
}

impl FromStr for SyncState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|state| state.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ModelError::unknown_label("sync state", s))
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip_covers_all_states() {
        for state in SyncState::ALL {
            assert_eq!(SyncState::from_code(state.code()), Some(state));
            assert_eq!(state.label().parse::<SyncState>().unwrap(), state);
        }
        assert_eq!(SyncState::from_code(12), None);
    }

    #[test]
    fn test_labels_match_device() {
        assert_eq!(SyncState::HoldoverExpired.label(), "Holdover expired");
        assert_eq!(SyncState::LockedM.to_string(), "Locked - M");
    }

    #[test]
    fn test_serde_uses_code() {
        let state: SyncState = serde_json::from_str("4").unwrap();
        assert_eq!(state, SyncState::Locked);
        assert_eq!(serde_json::to_string(&SyncState::Holdover).unwrap(), "6");
        assert!(serde_json::from_str::<SyncState>("42").is_err());
    }

    #[test]
    fn test_unknown_label_rejected() {
        let err = "Lockd".parse::<SyncState>().unwrap_err();
        assert!(matches!(err, ModelError::UnknownLabel { .. }));
    }
}
