//! Alarm models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Alarm severity as coded by the device API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AlarmSeverity {
    Major,
    Minor,
    Notify,
}

impl AlarmSeverity {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            3 => Some(Self::Major),
            4 => Some(Self::Minor),
            5 => Some(Self::Notify),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Major => 3,
            Self::Minor => 4,
            Self::Notify => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Major => "MAJOR",
            Self::Minor => "MINOR",
            Self::Notify => "NOTIFY",
        }
    }
}

impl TryFrom<u8> for AlarmSeverity {
    type Error = ModelError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| ModelError::unknown_code("alarm severity", code))
    }
}

impl From<AlarmSeverity> for u8 {
    fn from(severity: AlarmSeverity) -> Self {
        severity.code()
    }
}

impl FromStr for AlarmSeverity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "MAJOR" => Ok(Self::Major),
            "MINOR" => Ok(Self::Minor),
            "NOTIFY" => Ok(Self::Notify),
            other => Err(ModelError::unknown_label("alarm severity", other)),
        }
    }
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An active alarm row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub event_id: u32,
    pub severity: AlarmSeverity,
    #[serde(rename = "desc")]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_lookup_both_ways() {
        assert_eq!("MINOR".parse::<AlarmSeverity>().unwrap().code(), 4);
        assert_eq!(AlarmSeverity::from_code(5), Some(AlarmSeverity::Notify));
        assert_eq!(AlarmSeverity::from_code(2), None);
    }

    #[test]
    fn test_alarm_wire_names() {
        let alarm = Alarm {
            event_id: 175,
            severity: AlarmSeverity::Minor,
            description: "No power detected on AC2".into(),
        };
        let json = serde_json::to_value(&alarm).unwrap();
        assert_eq!(json["eventId"], 175);
        assert_eq!(json["severity"], 4);
        assert_eq!(json["desc"], "No power detected on AC2");
    }
}
