use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::Subsystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Active,
    Timeout,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SensorReading {
    pub temp: Option<f32>,
    pub humi: Option<f32>,
    pub status: SensorStatus,
    pub last_update: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total: u32,
    pub success: u32,
    pub error: u32,
    pub time_ms: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorLine {
    Reading { id: String, temp: f32, humi: f32 },
    Timeout { id: String },
    ScanComplete(ScanSummary),
}

/// Parse one line of sensor-scan output for `subsystem`.
///
/// Formats:
/// - `[TAG] IDnn,TEMP: <f>, HUMI: <f>`
/// - `[TAG] IDnn,Sensor Check TIMEOUT!`
/// - `[TAG] SEQUENTIAL SCAN COMPLETE: ... Total: n, Success: n, Error: n, Time: nms`
pub fn parse_sensor_line(subsystem: Subsystem, line: &str) -> Option<SensorLine> {
    let body = line.strip_prefix(subsystem.sensor_tag())?.trim_start();

    if let Some(rest) = body.strip_prefix("SEQUENTIAL SCAN COMPLETE:") {
        return parse_scan_summary(rest).map(SensorLine::ScanComplete);
    }

    let (id, rest) = body.split_once(',')?;
    if !is_sensor_id(id) {
        return None;
    }
    let id = id.to_string();

    if rest.trim() == "Sensor Check TIMEOUT!" {
        return Some(SensorLine::Timeout { id });
    }

    let rest = rest.trim_start().strip_prefix("TEMP:")?;
    let (temp, rest) = rest.split_once(',')?;
    let humi = rest.trim_start().strip_prefix("HUMI:")?;
    let temp = temp.trim().parse::<f32>().ok()?;
    let humi = humi.trim().parse::<f32>().ok()?;
    Some(SensorLine::Reading { id, temp, humi })
}

fn is_sensor_id(id: &str) -> bool {
    id.len() == 4 && id.starts_with("ID") && id[2..].bytes().all(|b| b.is_ascii_digit())
}

fn parse_scan_summary(text: &str) -> Option<ScanSummary> {
    let total_at = text.find("Total:")?;
    let text = &text[total_at..];
    Some(ScanSummary {
        total: labelled_number(text, "Total:")?,
        success: labelled_number(text, "Success:")?,
        error: labelled_number(text, "Error:")?,
        time_ms: labelled_number(text, "Time:")?,
    })
}

fn labelled_number(text: &str, label: &str) -> Option<u32> {
    let start = text.find(label)? + label.len();
    let digits: String = text[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// What applying one line to a `SensorArray` changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorChange {
    Updated { id: String, reading: SensorReading },
    BatchComplete(ScanSummary),
}

/// Latest reading per tracked sensor of one subsystem.
#[derive(Debug, Clone)]
pub struct SensorArray {
    subsystem: Subsystem,
    scanning: bool,
    readings: BTreeMap<String, SensorReading>,
}

impl SensorArray {
    pub fn new(subsystem: Subsystem) -> Self {
        let readings = subsystem
            .sensor_ids()
            .into_iter()
            .map(|id| (id, SensorReading::default()))
            .collect();
        Self {
            subsystem,
            scanning: false,
            readings,
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Called when the scan request has been written to the link.
    pub fn begin_scan(&mut self) {
        self.scanning = true;
    }

    pub fn abort_scan(&mut self) {
        self.scanning = false;
    }

    pub fn reading(&self, id: &str) -> Option<&SensorReading> {
        self.readings.get(id)
    }

    pub fn readings(&self) -> &BTreeMap<String, SensorReading> {
        &self.readings
    }

    /// True if the line belongs to this array's tag, whether or not it is accepted.
    pub fn owns(&self, line: &str) -> bool {
        line.starts_with(self.subsystem.sensor_tag())
    }

    /// Apply a line. Lines outside a scan and untracked sensor IDs are ignored.
    pub fn handle_line(&mut self, line: &str) -> Option<SensorChange> {
        if !self.scanning {
            log::debug!("[{}] Not scanning, ignoring: {}", self.subsystem, line);
            return None;
        }
        let subsystem = self.subsystem;
        match parse_sensor_line(subsystem, line)? {
            SensorLine::Reading { id, temp, humi } => {
                let slot = self.tracked(&id)?;
                *slot = SensorReading {
                    temp: Some(temp),
                    humi: Some(humi),
                    status: SensorStatus::Active,
                    last_update: Some(Local::now()),
                };
                Some(SensorChange::Updated { reading: slot.clone(), id })
            }
            SensorLine::Timeout { id } => {
                let slot = self.tracked(&id)?;
                slot.status = SensorStatus::Timeout;
                slot.temp = None;
                slot.humi = None;
                slot.last_update = Some(Local::now());
                log::warn!("[{}] {} sensor check timeout", subsystem, id);
                Some(SensorChange::Updated { reading: slot.clone(), id })
            }
            SensorLine::ScanComplete(summary) => {
                self.scanning = false;
                log::info!(
                    "[{}] Scan complete: total={}, success={}, error={}, time={}ms",
                    subsystem, summary.total, summary.success, summary.error, summary.time_ms
                );
                Some(SensorChange::BatchComplete(summary))
            }
        }
    }

    fn tracked(&mut self, id: &str) -> Option<&mut SensorReading> {
        let subsystem = self.subsystem;
        let slot = self.readings.get_mut(id);
        if slot.is_none() {
            log::debug!("[{}] Ignoring untracked sensor {}", subsystem, id);
        }
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reading_and_timeout() {
        assert_eq!(
            parse_sensor_line(Subsystem::Dsct, "[DSCT] ID03,TEMP: 24.5, HUMI: 41.0"),
            Some(SensorLine::Reading { id: "ID03".into(), temp: 24.5, humi: 41.0 })
        );
        assert_eq!(
            parse_sensor_line(Subsystem::Air, "[AIRCON] ID02,Sensor Check TIMEOUT!"),
            Some(SensorLine::Timeout { id: "ID02".into() })
        );
        // Wrong tag for the subsystem
        assert_eq!(parse_sensor_line(Subsystem::Air, "[DSCT] ID03,TEMP: 1.0, HUMI: 2.0"), None);
    }

    #[test]
    fn parses_scan_summary() {
        let line = "[DSCT] SEQUENTIAL SCAN COMPLETE: 12 sensors, Total: 12, Success: 11, Error: 1, Time: 2350ms";
        assert_eq!(
            parse_sensor_line(Subsystem::Dsct, line),
            Some(SensorLine::ScanComplete(ScanSummary { total: 12, success: 11, error: 1, time_ms: 2350 }))
        );
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(parse_sensor_line(Subsystem::Dsct, "[DSCT] ID03,TEMP: abc, HUMI: 41.0"), None);
        assert_eq!(parse_sensor_line(Subsystem::Dsct, "[DSCT] garbage"), None);
        assert_eq!(parse_sensor_line(Subsystem::Dsct, "[DSCT] SEQUENTIAL SCAN COMPLETE: Total: x"), None);
    }

    #[test]
    fn array_ignores_lines_outside_scan_and_untracked_ids() {
        let mut array = SensorArray::new(Subsystem::Air);
        assert_eq!(array.handle_line("[AIRCON] ID01,TEMP: 20.0, HUMI: 50.0"), None);

        array.begin_scan();
        assert_eq!(array.handle_line("[AIRCON] ID07,TEMP: 20.0, HUMI: 50.0"), None);
        match array.handle_line("[AIRCON] ID01,TEMP: 20.0, HUMI: 50.0") {
            Some(SensorChange::Updated { id, reading }) => {
                assert_eq!(id, "ID01");
                assert_eq!(reading.status, SensorStatus::Active);
            }
            other => panic!("unexpected {:?}", other),
        }
        let done = array.handle_line("[AIRCON] SEQUENTIAL SCAN COMPLETE: Total: 6, Success: 6, Error: 0, Time: 900ms");
        assert!(matches!(done, Some(SensorChange::BatchComplete(_))));
        assert!(!array.is_scanning());
    }

    #[test]
    fn timeout_discards_the_previous_reading() {
        let mut array = SensorArray::new(Subsystem::Air);
        array.begin_scan();
        array.handle_line("[AIRCON] ID01,TEMP: 20.0, HUMI: 50.0");
        match array.handle_line("[AIRCON] ID01,Sensor Check TIMEOUT!") {
            Some(SensorChange::Updated { reading, .. }) => {
                assert_eq!(reading.status, SensorStatus::Timeout);
                assert_eq!(reading.temp, None);
                assert_eq!(reading.humi, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(array.readings()["ID01"].temp, None);
    }
}
