//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry channel contract between simulated meters and the remote service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::borrow::Cow;

use bytes::Bytes;
use uuid::Uuid;

/// Cloud-to-device message handed out by [`crate::TelemetryChannel::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Identifier used to acknowledge the message.
    pub id: Uuid,
    /// Raw payload bytes as sent by the operator.
    pub body: Bytes,
}

impl InboundMessage {
    /// Construct a message with a fresh identifier.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: body.into(),
        }
    }

    /// Payload decoded as text; invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
