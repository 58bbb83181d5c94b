//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fleet orchestration and device loop scheduling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use msim_common::config::{DeviceConfig, SimulationConfig};
use msim_device::{Device, DeviceError};
use tokio::sync::broadcast;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::FleetCounters;

/// Retry parameters applied when a device first connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Total attempts before the device is left offline.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_delay: Duration,
}

impl ConnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after failed attempt `attempt` (1-indexed), capped at 2^8 times the base.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8);
        self.base_delay.saturating_mul(2u32.pow(exponent))
    }
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

impl From<&SimulationConfig> for ConnectPolicy {
    fn from(config: &SimulationConfig) -> Self {
        Self::new(config.connect_attempts, config.connect_backoff)
    }
}

/// Independent send and receive periods for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSchedule {
    pub send_interval: Duration,
    pub receive_interval: Duration,
}

impl DeviceSchedule {
    pub fn new(send_interval: Duration, receive_interval: Duration) -> Self {
        Self {
            send_interval,
            receive_interval,
        }
    }

    pub fn from_config(device: &DeviceConfig, simulation: &SimulationConfig) -> Self {
        Self::new(
            device.send_interval_or(simulation),
            device.receive_interval_or(simulation),
        )
    }
}

impl Default for DeviceSchedule {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(1))
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectResult {
    Connected,
    Offline,
    Shutdown,
}

/// Connect with exponential backoff between failed attempts.
pub(crate) async fn connect_with_retry(
    device: &Device,
    policy: ConnectPolicy,
    counters: &FleetCounters,
    shutdown: &mut broadcast::Receiver<()>,
) -> ConnectResult {
    for attempt in 1..=policy.max_attempts {
        match device.connect().await {
            Ok(()) => return ConnectResult::Connected,
            Err(DeviceError::NotRegistered { .. }) => {
                info!(device_id = device.id(), "device has no credential; staying offline");
                return ConnectResult::Offline;
            }
            Err(err) => {
                counters.record_connect_failure();
                if attempt == policy.max_attempts {
                    warn!(device_id = device.id(), attempts = attempt, error = %err, "connect attempts exhausted; device offline");
                    return ConnectResult::Offline;
                }
                let delay = policy.backoff_delay(attempt);
                warn!(device_id = device.id(), attempt, delay_ms = delay.as_millis() as u64, error = %err, "connect failed; retrying");
                tokio::select! {
                    _ = shutdown.recv() => return ConnectResult::Shutdown,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    ConnectResult::Offline
}

pub(crate) async fn run_send_loop(
    device: Arc<Device>,
    period: Duration,
    policy: ConnectPolicy,
    counters: Arc<FleetCounters>,
    mut shutdown: broadcast::Receiver<()>,
) {
    match connect_with_retry(&device, policy, &counters, &mut shutdown).await {
        ConnectResult::Connected => {}
        ConnectResult::Offline => {
            debug!(device_id = device.id(), "device not connected; send ticks will be skipped");
        }
        ConnectResult::Shutdown => return,
    }

    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(device_id = device.id(), "send loop shutdown");
                break;
            }
            _ = interval.tick() => {
                match device.send_reading().await {
                    Ok(outcome) => counters.record_send(&outcome),
                    Err(err) => {
                        counters.record_loop_failure();
                        warn!(device_id = device.id(), error = %err, "send cycle failed");
                    }
                }
            }
        }
    }
}

pub(crate) async fn run_receive_loop(
    device: Arc<Device>,
    period: Duration,
    counters: Arc<FleetCounters>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(device_id = device.id(), "receive loop shutdown");
                break;
            }
            _ = interval.tick() => {
                match device.poll_inbound().await {
                    Ok(outcome) => counters.record_poll(outcome),
                    Err(err) => {
                        counters.record_loop_failure();
                        warn!(device_id = device.id(), error = %err, "receive cycle failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ConnectPolicy::new(10, Duration::from_millis(10));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(80));
        assert_eq!(policy.backoff_delay(9), Duration::from_millis(2560));
        assert_eq!(policy.backoff_delay(30), Duration::from_millis(2560));
    }

    #[test]
    fn policy_requires_at_least_one_attempt() {
        assert_eq!(ConnectPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn schedule_falls_back_to_fleet_intervals() {
        let simulation = SimulationConfig::default();
        let device = DeviceConfig {
            send_interval: Some(Duration::from_millis(40)),
            ..DeviceConfig::default()
        };
        let schedule = DeviceSchedule::from_config(&device, &simulation);
        assert_eq!(schedule.send_interval, Duration::from_millis(40));
        assert_eq!(schedule.receive_interval, simulation.receive_interval);
    }
}
