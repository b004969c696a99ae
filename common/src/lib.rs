pub mod actuator;
pub mod config;
pub mod controller;
pub mod executor;
pub mod protocol;
pub mod store;
pub mod topics;
pub mod types;

pub use actuator::{ActuatorDriver, ActuatorError, ButtonLine, ButtonLines, Clock, Level};
pub use config::{ActuatorConfig, ButtonPinConfig, NetworkConfig, RunConfig, RuntimeConfig};
pub use controller::{Effect, ProfileController};
pub use executor::ScheduleExecutor;
pub use protocol::{ProtocolError, Request, Response, RunStatus, MAX_MESSAGE_BYTES};
pub use store::{BringUp, MediumError, PersistentMedium, ProfileStore, StoreError};
pub use topics::*;
pub use types::{CurrentStatus, Profile, RunAction, RunState, SetpointPoint, MAX_POINTS};
