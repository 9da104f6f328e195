pub mod bus;
pub mod config;
pub mod controller;
pub mod exchange;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod serial;
pub mod timer;

pub use config::{ConfigError, LinkConfig};
pub use controller::{ControllerError, ControllerEvent, ControllerStatus, HvacController, HvacControllerBuilder};
pub use exchange::{ReloadError, ValveError, ValveTarget};
pub use protocol::{format_command, Subsystem};
pub use queue::{CommandOutcome, CommandQueue, Priority};
pub use scheduler::{PollConfig, PollState, SensorPollingScheduler};
pub use serial::{LineSink, LineTransport, SerialError};
