//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy for simulated meter operations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use msim_channel::ChannelError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device '{device_id}' has no credential; register before connecting")]
    NotRegistered { device_id: String },
    #[error("device '{device_id}' could not create its telemetry channel: {source}")]
    ChannelCreation {
        device_id: String,
        #[source]
        source: ChannelError,
    },
    #[error("device '{device_id}' telemetry channel failed: {source}")]
    Channel {
        device_id: String,
        #[source]
        source: ChannelError,
    },
    #[error("reading serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
