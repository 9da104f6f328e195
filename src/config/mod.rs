//! Link configuration. Built once at startup and handed to the controller; runtime
//! changes go through the controller's setters.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exchange::valve::ValveTiming;
use crate::protocol::Subsystem;
use crate::scheduler::{PollConfig, MAX_CYCLE_INTERVAL, MIN_CYCLE_INTERVAL};
use crate::serial::{DEFAULT_BAUD_RATE, SUPPORTED_BAUD_RATES};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    pub port: Option<String>,
    pub baud_rate: u32,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Control loop period; queue dispatch and all timers are evaluated on this tick.
    pub tick_ms: u64,
    pub min_spacing_ms: u64,
    /// Total send attempts per command.
    pub max_retries: u32,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            min_spacing_ms: 50,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub cycle_interval_secs: u64,
    pub response_timeout_secs: u64,
    pub health_check_secs: u64,
    pub air_enabled: bool,
    pub dsct_enabled: bool,
    /// Start polling as soon as the controller is up.
    pub autostart: bool,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 5,
            response_timeout_secs: 10,
            health_check_secs: 5,
            air_enabled: true,
            dsct_enabled: true,
            autostart: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSection {
    pub timeout_secs: u64,
}

impl Default for ReloadSection {
    fn default() -> Self {
        Self { timeout_secs: 15 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveSection {
    pub subsystem: Subsystem,
    pub timeout_secs: u64,
    pub flicker_ms: u64,
    pub error_display_ms: u64,
}

impl Default for ValveSection {
    fn default() -> Self {
        Self {
            subsystem: Subsystem::Dsct,
            timeout_secs: 20,
            flicker_ms: 500,
            error_display_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub serial: SerialSection,
    pub queue: QueueSection,
    pub polling: PollingSection,
    pub reload: ReloadSection,
    pub valve: ValveSection,
}

impl LinkConfig {
    /// Parse and validate. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        log::info!("Loaded link config from {}", path.display());
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&self.serial.baud_rate) {
            return Err(ConfigError::Invalid(format!(
                "baud_rate {} not in {:?}",
                self.serial.baud_rate, SUPPORTED_BAUD_RATES
            )));
        }
        if self.queue.tick_ms == 0 {
            return Err(ConfigError::Invalid("queue.tick_ms must be > 0".to_string()));
        }
        if self.queue.max_retries == 0 {
            return Err(ConfigError::Invalid("queue.max_retries must be >= 1".to_string()));
        }
        let interval = Duration::from_secs(self.polling.cycle_interval_secs);
        if interval < MIN_CYCLE_INTERVAL || interval > MAX_CYCLE_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "polling.cycle_interval_secs must be {}..={}",
                MIN_CYCLE_INTERVAL.as_secs(),
                MAX_CYCLE_INTERVAL.as_secs()
            )));
        }
        for (name, value) in [
            ("polling.response_timeout_secs", self.polling.response_timeout_secs),
            ("polling.health_check_secs", self.polling.health_check_secs),
            ("reload.timeout_secs", self.reload.timeout_secs),
            ("valve.timeout_secs", self.valve.timeout_secs),
            ("valve.flicker_ms", self.valve.flicker_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.queue.tick_ms)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.queue.min_spacing_ms)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload.timeout_secs)
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            cycle_interval: Duration::from_secs(self.polling.cycle_interval_secs),
            response_timeout: Duration::from_secs(self.polling.response_timeout_secs),
            health_check_interval: Duration::from_secs(self.polling.health_check_secs),
            air_enabled: self.polling.air_enabled,
            dsct_enabled: self.polling.dsct_enabled,
        }
    }

    pub fn valve_timing(&self) -> ValveTiming {
        ValveTiming {
            timeout: Duration::from_secs(self.valve.timeout_secs),
            flicker_period: Duration::from_millis(self.valve.flicker_ms),
            error_display: Duration::from_millis(self.valve.error_display_ms),
        }
    }
}
