//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated meter lifecycle state machine and telemetry loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use msim_channel::{ChannelError, ChannelFactory, Credential, TelemetryChannel};
use msim_common::time::utc_now;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{DeviceError, Result};
use crate::readings::{Reading, ReadingGenerator, TemperatureBand};

/// Lifecycle state as reported to callers.
///
/// `Transmit` is part of the declared set but no transition enters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    New,
    Installed,
    Registered,
    Connected,
    Transmit,
}

/// Registration/connection axis, tracked independently of installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Registered,
    Connected,
}

/// Result of a [`Device::send_reading`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent(Reading),
    /// No channel, or the channel was torn down mid-call. Nothing was published.
    Skipped,
}

/// Result of a [`Device::poll_inbound`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollOutcome {
    /// No channel, or the channel was torn down mid-call.
    Skipped,
    /// Connected but no message was waiting.
    Idle,
    /// A numeric command set the temperature override.
    Override(f64),
    /// A non-numeric command cancelled the override.
    Cleared,
    /// The command was applied (`Some` set an override, `None` cleared it) but
    /// could not be acknowledged. A redelivery of it will not be applied again.
    Unacknowledged(Option<f64>),
    /// A command applied earlier came back after a failed acknowledgement and
    /// was acknowledged without being applied.
    Redelivered,
}

/// Point-in-time view of a device for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub state: DeviceState,
    pub connection: ConnectionState,
    pub installed: bool,
    pub installation_location: Option<String>,
    pub endpoint: Option<String>,
    pub temperature_override: Option<f64>,
    pub override_band: Option<TemperatureBand>,
    pub last_received_raw: Option<String>,
}

struct Registration {
    endpoint: String,
    credential: Credential,
}

#[derive(Default)]
struct Lifecycle {
    registration: Option<Registration>,
    connection: ConnectionState,
    installed: bool,
    installation_location: Option<String>,
    // present iff connection == Connected
    channel: Option<Arc<dyn TelemetryChannel>>,
}

impl Lifecycle {
    fn reported_state(&self) -> DeviceState {
        match self.connection {
            ConnectionState::Connected => DeviceState::Connected,
            ConnectionState::Registered => DeviceState::Registered,
            ConnectionState::New if self.installed => DeviceState::Installed,
            ConnectionState::New => DeviceState::New,
        }
    }
}

const MAX_UNACKNOWLEDGED: usize = 256;

#[derive(Debug, Default)]
struct InboundState {
    temperature_override: Option<f64>,
    last_received_raw: Option<String>,
    // applied commands whose acknowledgement failed, oldest first
    unacknowledged: VecDeque<Uuid>,
}

impl InboundState {
    fn remember_unacknowledged(&mut self, id: Uuid) {
        if self.unacknowledged.len() == MAX_UNACKNOWLEDGED {
            self.unacknowledged.pop_front();
        }
        self.unacknowledged.push_back(id);
    }

    fn forget_unacknowledged(&mut self, id: &Uuid) {
        self.unacknowledged.retain(|pending| pending != id);
    }
}

/// A simulated smart meter.
///
/// All operations take `&self` so a device can be shared (`Arc<Device>`) between
/// a send loop and a receive loop. Locks are never held across an `.await`.
pub struct Device {
    id: String,
    factory: Arc<dyn ChannelFactory>,
    generator: ReadingGenerator,
    lifecycle: Mutex<Lifecycle>,
    inbound: Mutex<InboundState>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        factory: Arc<dyn ChannelFactory>,
        generator: ReadingGenerator,
    ) -> Self {
        Self {
            id: id.into(),
            factory,
            generator,
            lifecycle: Mutex::new(Lifecycle::default()),
            inbound: Mutex::new(InboundState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Single-valued view of both lifecycle axes (Connected > Registered > Installed > New).
    pub fn state(&self) -> DeviceState {
        self.lifecycle.lock().reported_state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lifecycle.lock().connection
    }

    pub fn is_installed(&self) -> bool {
        self.lifecycle.lock().installed
    }

    pub fn installation_location(&self) -> Option<String> {
        self.lifecycle.lock().installation_location.clone()
    }

    pub fn has_channel(&self) -> bool {
        self.lifecycle.lock().channel.is_some()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.lifecycle
            .lock()
            .registration
            .as_ref()
            .map(|registration| registration.endpoint.clone())
    }

    /// Record the endpoint and credential used by the next [`Device::connect`].
    ///
    /// A connected device keeps its live channel; the new credential applies on reconnect.
    pub fn register(&self, endpoint: impl Into<String>, credential: impl Into<Credential>) {
        let endpoint = endpoint.into();
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.registration = Some(Registration {
            endpoint: endpoint.clone(),
            credential: credential.into(),
        });
        if lifecycle.connection != ConnectionState::Connected {
            lifecycle.connection = ConnectionState::Registered;
        }
        info!(device_id = %self.id, endpoint = %endpoint, connection = ?lifecycle.connection, "device registered");
    }

    /// Record where the device is installed. Never touches the connection axis.
    pub fn install(&self, location: impl Into<String>) {
        let location = location.into();
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.installed = true;
        lifecycle.installation_location = Some(location.clone());
        info!(device_id = %self.id, location = %location, "device installed");
    }

    /// Open the telemetry channel. No-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let (endpoint, credential) = {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.channel.is_some() {
                return Ok(());
            }
            let Some(registration) = &lifecycle.registration else {
                return Err(DeviceError::NotRegistered {
                    device_id: self.id.clone(),
                });
            };
            (
                registration.endpoint.clone(),
                registration.credential.clone(),
            )
        };

        let channel = self
            .factory
            .create(&endpoint, &self.id, &credential)
            .await
            .map_err(|source| DeviceError::ChannelCreation {
                device_id: self.id.clone(),
                source,
            })?;

        let superseded = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.channel.is_some() {
                Some(channel)
            } else {
                lifecycle.channel = Some(channel);
                lifecycle.connection = ConnectionState::Connected;
                None
            }
        };

        match superseded {
            Some(extra) => {
                debug!(device_id = %self.id, "concurrent connect won; releasing duplicate channel");
                if let Err(err) = extra.close().await {
                    debug!(device_id = %self.id, error = %err, "duplicate channel close failed");
                }
            }
            None => info!(device_id = %self.id, endpoint = %endpoint, "device connected"),
        }
        Ok(())
    }

    /// Release the channel and fall back to Registered. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let released = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.connection == ConnectionState::Connected {
                lifecycle.connection = ConnectionState::Registered;
            }
            lifecycle.channel.take()
        };

        let Some(channel) = released else {
            trace!(device_id = %self.id, "disconnect on idle device");
            return;
        };
        if let Err(err) = channel.close().await {
            warn!(device_id = %self.id, transport = channel.name(), error = %err, "channel close failed");
        }
        info!(device_id = %self.id, "device disconnected");
    }

    /// Current temperature: the override when one is in effect, a fresh sample otherwise.
    pub fn current_temperature(&self) -> f64 {
        if let Some(value) = self.inbound.lock().temperature_override {
            return value;
        }
        self.generator.sample_temperature()
    }

    pub fn current_voltage(&self) -> f64 {
        self.generator.sample_voltage()
    }

    pub fn temperature_override(&self) -> Option<f64> {
        self.inbound.lock().temperature_override
    }

    pub fn last_received_raw(&self) -> Option<String> {
        self.inbound.lock().last_received_raw.clone()
    }

    /// Sample a reading stamped with the current UTC time.
    pub fn next_reading(&self) -> Reading {
        Reading {
            id: self.id.clone(),
            timestamp: utc_now(),
            temperature: self.current_temperature(),
            voltage: self.current_voltage(),
        }
    }

    /// Publish one reading. Skipped silently when not connected.
    pub async fn send_reading(&self) -> Result<SendOutcome> {
        let Some(channel) = self.channel() else {
            trace!(device_id = %self.id, "send skipped; not connected");
            return Ok(SendOutcome::Skipped);
        };

        let reading = self.next_reading();
        let payload = reading.encode()?;
        match channel.send(payload).await {
            Ok(()) => {
                debug!(
                    device_id = %self.id,
                    transport = channel.name(),
                    temp = reading.temperature,
                    voltage = reading.voltage,
                    "reading sent"
                );
                Ok(SendOutcome::Sent(reading))
            }
            Err(err) => self.torn_down_or_fail(err, "send").map(|()| SendOutcome::Skipped),
        }
    }

    /// Receive at most one command and apply it to the temperature override.
    pub async fn poll_inbound(&self) -> Result<PollOutcome> {
        let Some(channel) = self.channel() else {
            trace!(device_id = %self.id, "poll skipped; not connected");
            return Ok(PollOutcome::Skipped);
        };

        let message = match channel.receive().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.inbound.lock().last_received_raw = None;
                return Ok(PollOutcome::Idle);
            }
            Err(err) => {
                return self
                    .torn_down_or_fail(err, "receive")
                    .map(|()| PollOutcome::Skipped)
            }
        };

        let redelivery = self.inbound.lock().unacknowledged.contains(&message.id);
        if redelivery {
            return match channel.acknowledge(&message).await {
                Ok(()) => {
                    self.inbound.lock().forget_unacknowledged(&message.id);
                    debug!(device_id = %self.id, message_id = %message.id, "redelivered command acknowledged without reapplying");
                    Ok(PollOutcome::Redelivered)
                }
                Err(err) => self
                    .torn_down_or_fail(err, "acknowledge")
                    .map(|()| PollOutcome::Skipped),
            };
        }

        let text = message.text().into_owned();
        let parsed = parse_override(&text);
        {
            let mut inbound = self.inbound.lock();
            inbound.temperature_override = parsed;
            inbound.last_received_raw = Some(text);
        }
        let outcome = match parsed {
            Some(value) => {
                info!(device_id = %self.id, temperature_override = value, "temperature override applied");
                PollOutcome::Override(value)
            }
            None => {
                info!(device_id = %self.id, "temperature override cleared");
                PollOutcome::Cleared
            }
        };

        // state already changed: report the outcome whatever the acknowledgement does
        match channel.acknowledge(&message).await {
            Ok(()) => Ok(outcome),
            Err(err) => {
                self.inbound.lock().remember_unacknowledged(message.id);
                if err.is_transient() {
                    debug!(device_id = %self.id, message_id = %message.id, "channel torn down before acknowledge");
                    Ok(outcome)
                } else {
                    warn!(device_id = %self.id, message_id = %message.id, error = %err, "command applied but not acknowledged");
                    Ok(PollOutcome::Unacknowledged(parsed))
                }
            }
        }
    }

    pub fn status(&self) -> DeviceStatus {
        let (state, connection, installed, installation_location, endpoint) = {
            let lifecycle = self.lifecycle.lock();
            (
                lifecycle.reported_state(),
                lifecycle.connection,
                lifecycle.installed,
                lifecycle.installation_location.clone(),
                lifecycle
                    .registration
                    .as_ref()
                    .map(|registration| registration.endpoint.clone()),
            )
        };
        let inbound = self.inbound.lock();
        DeviceStatus {
            id: self.id.clone(),
            state,
            connection,
            installed,
            installation_location,
            endpoint,
            temperature_override: inbound.temperature_override,
            override_band: inbound
                .temperature_override
                .map(|value| self.generator.profile().classify(value)),
            last_received_raw: inbound.last_received_raw.clone(),
        }
    }

    fn channel(&self) -> Option<Arc<dyn TelemetryChannel>> {
        self.lifecycle.lock().channel.clone()
    }

    /// `Ok` when the channel merely went away under a concurrent disconnect.
    fn torn_down_or_fail(&self, err: ChannelError, operation: &'static str) -> Result<()> {
        if err.is_transient() {
            debug!(device_id = %self.id, operation, "channel torn down mid-call; skipping");
            return Ok(());
        }
        Err(DeviceError::Channel {
            device_id: self.id.clone(),
            source: err,
        })
    }
}

/// A finite number sets the override; anything else (empty, text, NaN, inf) clears it.
/// Only plain decimal/exponent syntax is accepted, so `"1,000"` clears.
fn parse_override(text: &str) -> Option<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}
