//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry channel contract between simulated meters and the remote service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Contract a simulated meter requires from the transport that moves its
//! telemetry to and from the remote service.
//!
//! Real transports (authenticated cloud clients) live outside this workspace;
//! [`loopback`] provides an in-process hub used by the daemon and by tests.
#![warn(missing_docs)]

pub mod loopback;
pub mod message;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use loopback::{ChannelOperation, LoopbackChannel, LoopbackFactory, LoopbackHub};
pub use message::InboundMessage;

/// Shared result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Failures reported by a telemetry channel or its factory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel was torn down (closed or released) before or during the call.
    #[error("channel has been closed")]
    Closed,
    /// The remote service rejected the device identity or credential.
    #[error("device '{device_id}' is not authorized")]
    Unauthorized {
        /// Device the credential was presented for.
        device_id: String,
    },
    /// The endpoint address does not resolve to a reachable service.
    #[error("endpoint '{endpoint}' is unreachable")]
    EndpointUnreachable {
        /// Address that was dialled.
        endpoint: String,
    },
    /// An acknowledgement referenced a message the service is not tracking.
    #[error("message {message_id} is not pending acknowledgement")]
    UnknownMessage {
        /// Identifier of the acknowledged message.
        message_id: uuid::Uuid,
    },
    /// Any other transport level failure.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ChannelError {
    /// Whether the error only means the channel went away underneath the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

/// Opaque authentication material presented when creating a channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw key.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the raw key to a transport implementation.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Bidirectional telemetry link held by a connected device.
#[async_trait]
pub trait TelemetryChannel: Send + Sync {
    /// Publish an encoded reading. Fire-and-forget from the caller's perspective.
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Poll for the next inbound message without blocking for long.
    async fn receive(&self) -> Result<Option<InboundMessage>>;

    /// Confirm that a received message has been processed.
    async fn acknowledge(&self, message: &InboundMessage) -> Result<()>;

    /// Best-effort teardown. Later calls on a closed channel report [`ChannelError::Closed`].
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

/// Creates channels from an endpoint address and device credential.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open a channel on behalf of `device_id`.
    async fn create(
        &self,
        endpoint: &str,
        device_id: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn TelemetryChannel>>;
}
