//! Multi-step exchanges layered on the line transport: the bulk state reload and the
//! long-running valve actuation.
pub mod reload;
pub mod valve;

pub use reload::{ReloadExchange, ReloadOutcome};
pub use valve::{ValveAck, ValveActuationExchange, ValveEvent, ValvePhase, ValveTarget};

use serde::{Deserialize, Serialize};

use crate::protocol::Subsystem;

/// What an exchange did with an inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineDisposition<T> {
    /// Not for this exchange; route it elsewhere.
    Ignored,
    Consumed,
    /// Consumed, and the exchange finished with this result.
    Finished(T),
}

impl<T> LineDisposition<T> {
    pub fn is_ignored(&self) -> bool {
        matches!(self, LineDisposition::Ignored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ReloadError {
    #[error("Reload already in progress for {0}")]
    AlreadyInProgress(Subsystem),

    #[error("Serial link is not connected")]
    NotConnected,

    #[error("Reload of {0} timed out")]
    Timeout(Subsystem),

    #[error("Link error: {0}")]
    Link(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ValveError {
    #[error("Valve actuation already in progress")]
    AlreadyInProgress,

    #[error("Serial link is not connected")]
    NotConnected,
}
