//! Parsers for device CLI output

use std::sync::LazyLock;

use k2_core::{Alarm, AlarmSeverity};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

static ACTIVE_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Active Image Version.*?(\d+\.\d+\.\d+(?:\.\d+)?)").expect("valid regex")
});

static PACKET_LOSS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)% packet loss").expect("valid regex"));

/// `show system` summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub software_version: Option<String>,
    pub oscillator: Option<String>,
}

/// `show gnss status` key/value block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GnssStatus {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub height_ellipsoid: Option<String>,
    pub fix_quality: Option<String>,
    pub used_satellites: Option<String>,
    pub receiver_status: Option<String>,
    pub operation_mode: Option<String>,
    pub antenna_status: Option<String>,
    pub sbas_constellation: Option<String>,
}

/// One row of the `show gnss status` satellite table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteView {
    pub sat_id: String,
    pub gnss_id: String,
    pub snr: String,
    pub azimuth: String,
    pub elevation: String,
    pub pr_res: String,
}

/// Value after the first `:` on a line
fn value_after_colon(line: &str) -> Option<String> {
    line.split_once(':').map(|(_, value)| value.trim().to_string())
}

/// Cells of a `|a|b|c|` table row, with the empty edge cells kept
fn cells(line: &str) -> Vec<&str> {
    line.split('|').map(str::trim).collect()
}

fn has_letters(line: &str) -> bool {
    line.chars().any(|c| c.is_ascii_alphabetic())
}

/// Parse the alarm table from `show alarm`
///
/// ```text
/// |ID |Severity|Time               |Description   |
/// |---|--------|-------------------|--------------|
/// |175|MINOR   |2021-09-09 04:14:35|No power on AC2|
/// ```
pub fn parse_alarms(output: &str) -> Result<Vec<Alarm>> {
    let mut alarms = Vec::new();
    let mut in_table = false;

    for line in output.lines().map(str::trim) {
        if !in_table {
            in_table = line.contains("ID");
            continue;
        }
        // separator rows have no letters
        if !has_letters(line) {
            continue;
        }
        let row = cells(line);
        if row.len() < 5 {
            continue;
        }
        let event_id = row[1]
            .parse()
            .map_err(|_| DeviceError::Parse(format!("bad alarm id in row: {}", line)))?;
        let severity: AlarmSeverity = row[2].parse()?;
        alarms.push(Alarm {
            event_id,
            severity,
            description: row[4].to_string(),
        });
    }

    Ok(alarms)
}

/// Parse `show gnss status` into the status block and the satellite table
pub fn parse_gnss(output: &str) -> (Vec<SatelliteView>, GnssStatus) {
    let mut status = GnssStatus::default();
    let mut satellites = Vec::new();
    let mut in_status = false;
    let mut in_table = false;

    for line in output.lines() {
        if line.contains("Index") {
            in_status = false;
            in_table = true;
            continue;
        }

        if in_table {
            let row = cells(line);
            if has_letters(line) && row.len() >= 7 {
                satellites.push(SatelliteView {
                    sat_id: row[1].to_string(),
                    gnss_id: row[2].to_string(),
                    snr: row[3].to_string(),
                    azimuth: row[4].to_string(),
                    elevation: row[5].to_string(),
                    pr_res: row[6].to_string(),
                });
            }
            continue;
        }

        if line.contains("Latitude") {
            in_status = true;
        }
        if !in_status {
            continue;
        }

        let slot = if line.contains("Latitude") {
            &mut status.latitude
        } else if line.contains("Longitude") {
            &mut status.longitude
        } else if line.contains("HGT Val Ellipsoid") {
            &mut status.height_ellipsoid
        } else if line.contains("Fix Quality") {
            &mut status.fix_quality
        } else if line.contains("Used Satellites") {
            &mut status.used_satellites
        } else if line.contains("Reciever Status") || line.contains("Receiver Status") {
            &mut status.receiver_status
        } else if line.contains("Operation Mode") {
            &mut status.operation_mode
        } else if line.contains("Antenna Status") {
            &mut status.antenna_status
        } else if line.contains("SBAS Constellation") {
            &mut status.sbas_constellation
        } else {
            continue;
        };
        *slot = value_after_colon(line);
    }

    (satellites, status)
}

/// Parse `show system`
pub fn parse_system(output: &str) -> SystemInfo {
    let mut info = SystemInfo::default();
    for line in output.lines() {
        if line.contains("Serial Num") {
            info.serial_number = value_after_colon(line);
        } else if line.contains("Model Num") {
            info.model = value_after_colon(line);
        } else if line.contains("Build") {
            info.software_version = value_after_colon(line);
        } else if line.contains("Oscillator Type") {
            info.oscillator = value_after_colon(line);
        }
    }
    info
}

/// Active image version from `show image`
pub fn parse_active_image(output: &str) -> Option<String> {
    ACTIVE_IMAGE
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Packet loss percentage from `ping` output
pub fn parse_packet_loss(output: &str) -> Option<f64> {
    PACKET_LOSS
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALARMS: &str = "\
show alarm
|ID |Severity|Time               |Description                                   |
|---|--------|-------------------|----------------------------------------------|
|175|MINOR   |2021-09-09 04:14:35|No power detected on AC2                      |
|12 |MAJOR   |2021-09-09 04:15:01|GNSS antenna open                             |
";

    #[test]
    fn test_parse_alarms() {
        let alarms = parse_alarms(ALARMS).unwrap();
        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[0].event_id, 175);
        assert_eq!(alarms[0].severity, AlarmSeverity::Minor);
        assert_eq!(alarms[0].description, "No power detected on AC2");
        assert_eq!(alarms[1].severity, AlarmSeverity::Major);
    }

    #[test]
    fn test_parse_alarms_without_table() {
        assert!(parse_alarms("no alarms").unwrap().is_empty());
    }

    #[test]
    fn test_parse_alarms_rejects_unknown_severity() {
        let output = "|ID|Severity|Time|Description|\n|1|SEVERE|now|oops|\n";
        assert!(parse_alarms(output).is_err());
    }

    #[test]
    fn test_parse_gnss() {
        let output = "\
GNSS Status
Latitude                  : 37 24 47.054 N
Longitude                 : 121 55 44.123 W
Fix Quality               : 3D
Used Satellites           : 9
Reciever Status           : Tracking
Antenna Status            : OK
|Sat Index|GNSS   |SNR|Azimuth|Elevation|PR Res|
|---------|-------|---|-------|---------|------|
|5        |GPS    |42 |120    |45       |0.3   |
|71       |GLONASS|38 |210    |30       |-0.1  |
";
        let (satellites, status) = parse_gnss(output);
        assert_eq!(status.latitude.as_deref(), Some("37 24 47.054 N"));
        assert_eq!(status.used_satellites.as_deref(), Some("9"));
        assert_eq!(status.receiver_status.as_deref(), Some("Tracking"));
        assert_eq!(status.operation_mode, None);
        assert_eq!(satellites.len(), 2);
        assert_eq!(satellites[0].sat_id, "5");
        assert_eq!(satellites[1].gnss_id, "GLONASS");
        assert_eq!(satellites[0].pr_res, "0.3");
    }

    #[test]
    fn test_parse_system() {
        let output = "\
Serial Num      : 1234-5678
Model Num       : SyncServer S650
Build           : 5.1.2.7
Oscillator Type : OCXO
";
        let info = parse_system(output);
        assert_eq!(info.serial_number.as_deref(), Some("1234-5678"));
        assert_eq!(info.software_version.as_deref(), Some("5.1.2.7"));
        assert_eq!(info.oscillator.as_deref(), Some("OCXO"));
    }

    #[test]
    fn test_parse_active_image_and_loss() {
        assert_eq!(
            parse_active_image("Active Image Version   : 2.3.1.12\nBackup: 2.2.0").as_deref(),
            Some("2.3.1.12")
        );
        assert_eq!(parse_active_image("nothing here"), None);
        assert_eq!(
            parse_packet_loss("4 packets transmitted, 4 received, 0% packet loss, time 3004ms"),
            Some(0.0)
        );
        assert_eq!(
            parse_packet_loss("4 packets transmitted, 3 received, 25% packet loss"),
            Some(25.0)
        );
    }
}
