//! Reference priority lists and the per-API-generation index convention

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TimeSource;
use crate::error::ModelError;

/// Device REST API generation
///
/// The generations disagree on how priorities are numbered:
///
/// | generation | firmware | read base | write base |
/// |------------|----------|-----------|------------|
/// | `v1`       | 4.x      | 1         | 1          |
/// | `v2`       | 5.x      | 0         | 1          |
///
/// `v2` hands priorities out 0-based but only accepts them 1-based, so every
/// list read from a `v2` device must go through [`ApiGeneration::to_wire`]
/// before it is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiGeneration {
    V1,
    #[default]
    V2,
}

impl ApiGeneration {
    /// Path segment under `/api/`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }

    /// Priority value of the top entry in a list as read from the device
    pub fn read_base(self) -> i64 {
        match self {
            Self::V1 => 1,
            Self::V2 => 0,
        }
    }

    /// Offset added to every priority when writing a list back
    pub fn write_offset(self) -> i64 {
        match self {
            Self::V1 => 0,
            Self::V2 => 1,
        }
    }

    /// Convert a list in read numbering into the numbering the device accepts
    pub fn to_wire(self, list: &ReferencePriorityList) -> ReferencePriorityList {
        let offset = self.write_offset();
        ReferencePriorityList(
            list.iter()
                .cloned()
                .map(|mut entry| {
                    entry.priority += offset;
                    entry
                })
                .collect(),
        )
    }
}

impl FromStr for ApiGeneration {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(ModelError::unknown_label("API generation", other)),
        }
    }
}

impl fmt::Display for ApiGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `timeRefPriority`
///
/// Fields the harness does not interpret are carried in `extra` so that a
/// read-modify-write cycle does not drop them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityEntry {
    pub source: u8,
    pub priority: i64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PriorityEntry {
    pub fn new(source: TimeSource, priority: i64) -> Self {
        Self {
            source: source.code(),
            priority,
            enabled: true,
            extra: Map::new(),
        }
    }

    pub fn time_source(&self) -> Option<TimeSource> {
        TimeSource::from_code(self.source)
    }
}

/// Ordered `timeRefPriority` list
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferencePriorityList(pub Vec<PriorityEntry>);

impl ReferencePriorityList {
    pub fn new(entries: Vec<PriorityEntry>) -> Self {
        Self(entries)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PriorityEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[PriorityEntry] {
        &self.0
    }

    pub fn entries_mut(&mut self) -> &mut [PriorityEntry] {
        &mut self.0
    }

    /// Index of the entry for `source`
    pub fn position_of(&self, source: TimeSource) -> Option<usize> {
        self.0.iter().position(|e| e.source == source.code())
    }

    pub fn contains(&self, source: TimeSource) -> bool {
        self.position_of(source).is_some()
    }

    /// Index of the entry holding the highest priority (lowest value)
    ///
    /// Ties resolve to the first entry in list order.
    pub fn top_index(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .min_by_key(|(index, entry)| (entry.priority, *index))
            .map(|(index, _)| index)
    }

    /// Exchange the priority values of two entries
    pub fn swap_priorities(&mut self, a: usize, b: usize) {
        let pa = self.0[a].priority;
        self.0[a].priority = self.0[b].priority;
        self.0[b].priority = pa;
    }

    /// Priority values in list order
    pub fn priorities(&self) -> Vec<i64> {
        self.0.iter().map(|e| e.priority).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn list(priorities: &[(TimeSource, i64)]) -> ReferencePriorityList {
        ReferencePriorityList::new(
            priorities
                .iter()
                .map(|(source, priority)| PriorityEntry::new(*source, *priority))
                .collect(),
        )
    }

    #[test]
    fn test_v2_write_is_one_based() {
        let read = list(&[(TimeSource::Gnss, 0), (TimeSource::Ptp, 1)]);
        assert_eq!(ApiGeneration::V2.to_wire(&read).priorities(), vec![1, 2]);
        assert_eq!(ApiGeneration::V1.to_wire(&read).priorities(), vec![0, 1]);
    }

    #[test]
    fn test_top_index_is_lowest_value() {
        let read = list(&[
            (TimeSource::Gnss, 2),
            (TimeSource::Ptp, 0),
            (TimeSource::SlotAJ1Timecode, 1),
        ]);
        assert_eq!(read.top_index(), Some(1));
        assert_eq!(read.position_of(TimeSource::SlotAJ1Timecode), Some(2));
        assert!(!read.contains(TimeSource::SlotBJ1Timecode));
        assert_eq!(ReferencePriorityList::default().top_index(), None);
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let raw = json!([
            { "source": 0, "priority": 0, "enabled": true, "label": "gnss-in" },
        ]);
        let parsed: ReferencePriorityList = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(parsed.entries()[0].time_source(), Some(TimeSource::Gnss));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);
    }

    #[test]
    fn test_generation_parsing() {
        assert_eq!("V2".parse::<ApiGeneration>().unwrap(), ApiGeneration::V2);
        assert_eq!(ApiGeneration::V1.read_base(), 1);
        assert!("v3".parse::<ApiGeneration>().is_err());
    }
}
