use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Subsystem;

/// Functions each subsystem reports in a reload stream. Anything else is skipped
/// so newer firmware does not break older hosts.
const AIR_FUNCTIONS: &[&str] = &[
    "FAN", "FSPD", "CON_F", "CON_SPD", "ALTDMP", "ALBDMP", "ARTDMP", "ARBDMP", "INVERTER", "CLUCH",
    // Automatic-mode settings
    "AUTOMODE", "TEMPSET", "CO2SET", "PM25SET", "SEMITIME",
];

const DSCT_FUNCTIONS: &[&str] = &[
    "FAN", "FAN1", "FAN2", "FAN3", "FAN4", "FSPD", "LDMP", "RDMP", "LHOT", "LCOOL", "RHOT",
    "RCOOL", "SOL", "SOL1", "SOL2", "SOL3", "SOL4", "PUMP", "PUMP1", "PUMP2", "MODE",
];

pub fn is_known_function(subsystem: Subsystem, function: &str) -> bool {
    let table = match subsystem {
        Subsystem::Air => AIR_FUNCTIONS,
        Subsystem::Dsct => DSCT_FUNCTIONS,
    };
    table.contains(&function)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateLineError {
    #[error("expected at least 3 fields, got {0}")]
    TooFewFields(usize),

    #[error("line is for subsystem {0}")]
    WrongSubsystem(String),

    #[error("unknown function {0}")]
    UnknownFunction(String),
}

/// One `subsystem,function,value[,value...]` line from a reload stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateUpdate {
    pub subsystem: Subsystem,
    pub function: String,
    pub values: Vec<String>,
}

impl DeviceStateUpdate {
    pub fn parse(subsystem: Subsystem, line: &str) -> Result<Self, StateLineError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 || fields.iter().take(2).any(|f| f.is_empty()) {
            return Err(StateLineError::TooFewFields(fields.len()));
        }
        if fields[0] != subsystem.namespace() {
            return Err(StateLineError::WrongSubsystem(fields[0].to_string()));
        }
        if !is_known_function(subsystem, fields[1]) {
            return Err(StateLineError::UnknownFunction(fields[1].to_string()));
        }
        Ok(Self {
            subsystem,
            function: fields[1].to_string(),
            values: fields[2..].iter().map(|v| v.to_string()).collect(),
        })
    }

    /// Parse a whole collected batch, skipping lines that do not parse.
    pub fn parse_batch(subsystem: Subsystem, lines: &[String]) -> Vec<Self> {
        lines
            .iter()
            .filter_map(|line| match Self::parse(subsystem, line) {
                Ok(update) => Some(update),
                Err(StateLineError::UnknownFunction(function)) => {
                    log::info!("[{}] Skipping unknown reload function {}", subsystem, function);
                    None
                }
                Err(e) => {
                    log::warn!("[{}] Skipping malformed reload line '{}': {}", subsystem, line, e);
                    None
                }
            })
            .collect()
    }
}

/// Last known device state per subsystem, as reported by reload streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Incremented once per applied batch.
    pub revision: u64,
    pub functions: BTreeMap<Subsystem, BTreeMap<String, Vec<String>>>,
}

impl DeviceState {
    pub fn apply_batch(&mut self, updates: &[DeviceStateUpdate]) {
        for update in updates {
            self.functions
                .entry(update.subsystem)
                .or_default()
                .insert(update.function.clone(), update.values.clone());
        }
        self.revision += 1;
    }

    pub fn get(&self, subsystem: Subsystem, function: &str) -> Option<&[String]> {
        self.functions
            .get(&subsystem)?
            .get(function)
            .map(Vec::as_slice)
    }
}
