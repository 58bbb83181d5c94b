//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the simulator runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the meter simulator workspace.
//! This crate exposes configuration loading, logging, and wire timestamp
//! helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, DeviceConfig, EndpointConfig, LoadedAppConfig, LoggingConfig, SimulationConfig,
};
pub use logging::{init_tracing, LogFormat};
