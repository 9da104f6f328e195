use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityReading {
    pub co2_ppm: u32,
    pub pm25: u32,
    pub temp: f32,
    pub humidity: Option<f32>,
}

/// Parse an unsolicited air-quality report:
/// - `PT02 <co2>,<pm25>,<temp>[,<humidity>]`
/// - `[AIRCON] <co2>,<pm25>,<temp x 10>` (older firmware, no humidity)
pub fn parse_air_quality_line(line: &str) -> Option<AirQualityReading> {
    if let Some(rest) = line.strip_prefix("[AIRCON]") {
        return parse_legacy(rest);
    }
    let rest = line.strip_prefix("PT02")?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let values: Vec<&str> = rest.trim().split(',').map(str::trim).collect();
    if values.len() < 3 {
        return None;
    }
    let humidity = match values.get(3) {
        Some(v) => Some(v.parse::<f32>().ok()?),
        None => None,
    };
    Some(AirQualityReading {
        co2_ppm: values[0].parse().ok()?,
        pm25: values[1].parse().ok()?,
        temp: values[2].parse().ok()?,
        humidity,
    })
}

fn parse_legacy(rest: &str) -> Option<AirQualityReading> {
    let values: Vec<&str> = rest.trim().split(',').map(str::trim).collect();
    if values.len() < 3 {
        return None;
    }
    let tenths: i32 = values[2].parse().ok()?;
    Some(AirQualityReading {
        co2_ppm: values[0].parse().ok()?,
        pm25: values[1].parse().ok()?,
        temp: tenths as f32 / 10.0,
        humidity: None,
    })
}
