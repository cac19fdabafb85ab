pub mod client;
pub mod codec;
pub mod collector;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod parser;
pub mod profile;
pub mod register;
pub mod snapshot;

#[cfg(test)]
mod dispatcher_tests;
#[cfg(test)]
mod parser_tests;
#[cfg(test)]
mod test_support;

pub use client::{Inverter, InverterClient};
pub use collector::{DataCollector, PollStatus, RefreshOutcome, SnapshotObserver};
pub use config::{ClientConfig, CollectorConfig};
pub use discovery::{discover_device, resolve_local_address, Endpoints};
pub use error::{ClientError, Result};
pub use profile::{DeviceProfile, Protocol};
pub use snapshot::{Battery, Grid, Output, Pv, PvString, RatingInfo, SystemStatus, TelemetrySnapshot};
