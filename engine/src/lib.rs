//! LN2 purge-and-fill engine for a multi-camera spectrograph.
//!
//! One invocation opens the shared purge valve, waits until the gas-line
//! thermistor reports cold liquid, then fills every camera dewar in
//! parallel, closing each valve on its own thermistor. The runner watches
//! the O2 alarm and the LN2 e-stops the whole time and guarantees that
//! every valve it ever opened is closed on any exit path.

pub mod alerts;
pub mod config;
pub mod error;
pub mod fill;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod nps;
pub mod retry;
pub mod runner;
pub mod safety_task;
pub mod specs;
pub mod thermistor;
pub mod tools;
pub mod validate;
pub mod valve;
pub mod web;

pub use config::{Action, Config, ConfigFile, Overrides};
pub use error::FillError;
pub use fill::FillSequence;
pub use runner::{Drivers, RunRecord};
pub use valve::ValveSupervisor;
