//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fleet orchestration module exports."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Runs a fleet of simulated meters: each device gets an independent send
//! loop and receive loop, coordinated by a single shutdown broadcast.

pub mod fleet;
pub mod metrics;
pub mod replay;
pub mod runner;

pub use fleet::{Fleet, FleetError, FleetHandle};
pub use metrics::FleetMetrics;
pub use replay::{load_commands, parse_commands, replay_commands, CommandRecord};
pub use runner::{ConnectPolicy, DeviceSchedule};
