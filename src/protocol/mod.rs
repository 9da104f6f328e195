//! Text protocol spoken by the controller board: command builder, subsystem
//! namespaces and parsers for every inbound line family.
pub mod air_quality;
pub mod sensor;
pub mod state;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use air_quality::{parse_air_quality_line, AirQualityReading};
pub use sensor::{
    parse_sensor_line, ScanSummary, SensorArray, SensorChange, SensorLine, SensorReading, SensorStatus,
};
pub use state::{DeviceState, DeviceStateUpdate, StateLineError};

pub const COMMAND_PREFIX: &str = "$CMD";

/// Emitted by the board for a reload of either subsystem.
pub const RELOAD_START_MARKER: &str = "EEPROM_ACK,RELOAD,START";

/// One of the two independently addressed hardware zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Subsystem {
    /// Air-conditioning unit, command namespace `AIR`.
    Air,
    /// Desiccant dehumidifier, command namespace `DSCT`.
    Dsct,
}

impl Subsystem {
    /// Order in which a poll cycle visits the subsystems.
    pub const POLL_ORDER: [Subsystem; 2] = [Subsystem::Air, Subsystem::Dsct];

    pub fn namespace(self) -> &'static str {
        match self {
            Subsystem::Air => "AIR",
            Subsystem::Dsct => "DSCT",
        }
    }

    /// Bracketed tag that prefixes sensor-scan output.
    pub fn sensor_tag(self) -> &'static str {
        match self {
            Subsystem::Air => "[AIRCON]",
            Subsystem::Dsct => "[DSCT]",
        }
    }

    pub fn sensor_count(self) -> u8 {
        match self {
            Subsystem::Air => 6,
            Subsystem::Dsct => 12,
        }
    }

    /// `ID01`..`IDnn` for every sensor the array tracks.
    pub fn sensor_ids(self) -> Vec<String> {
        (1..=self.sensor_count()).map(|i| format!("ID{:02}", i)).collect()
    }

    /// Prefix carried by reload data lines, e.g. `DSCT,`.
    pub fn reload_prefix(self) -> String {
        format!("{},", self.namespace())
    }

    pub fn reload_complete_marker(self) -> String {
        format!("{}_ACK,RELOAD,COMPLETE", self.namespace())
    }

    pub fn sensor_request(self) -> String {
        format_command(self.namespace(), "TH", &[])
    }

    pub fn reload_request(self) -> String {
        format_command(self.namespace(), "RELOAD", &[])
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for Subsystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AIR" | "AIRCON" => Ok(Subsystem::Air),
            "DSCT" => Ok(Subsystem::Dsct),
            other => Err(format!("unknown subsystem '{}'", other)),
        }
    }
}

/// Build a `$CMD,<NAMESPACE>,<FUNCTION>[,<ARG>...]` payload. The terminator is added by
/// the transport.
pub fn format_command(namespace: &str, function: &str, args: &[&str]) -> String {
    let mut payload = String::with_capacity(32);
    payload.push_str(COMMAND_PREFIX);
    for part in [namespace, function].into_iter().chain(args.iter().copied()) {
        if part.is_empty() {
            continue;
        }
        payload.push(',');
        payload.push_str(part);
    }
    payload
}
