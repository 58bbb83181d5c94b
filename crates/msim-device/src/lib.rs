//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated meter module exports and shared types."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Simulated smart meter for the fleet simulator.
//!
//! A [`Device`] walks through install/register/connect, publishes
//! [`Reading`]s over an injected telemetry channel, and applies inbound
//! temperature override commands.

pub mod device;
pub mod error;
pub mod readings;

pub use device::{ConnectionState, Device, DeviceState, DeviceStatus, PollOutcome, SendOutcome};
pub use error::{DeviceError, Result};
pub use readings::{Reading, ReadingGenerator, ReadingProfile, TemperatureBand};
