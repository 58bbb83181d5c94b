//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Lifecycle and telemetry loop tests for simulated meters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use msim_channel::{
    ChannelError, ChannelFactory, ChannelOperation, Credential, LoopbackHub, TelemetryChannel,
};
use msim_device::{
    ConnectionState, Device, DeviceError, DeviceState, PollOutcome, Reading, ReadingGenerator,
    ReadingProfile, SendOutcome,
};

const ENDPOINT: &str = "loopback://meters.test";

fn device(hub: &Arc<LoopbackHub>, id: &str, seed: u64) -> Arc<Device> {
    Arc::new(Device::new(
        id,
        hub.factory(),
        ReadingGenerator::seeded(ReadingProfile::default(), seed),
    ))
}

async fn connected(hub: &Arc<LoopbackHub>, id: &str) -> Arc<Device> {
    hub.provision(id, "key");
    let device = device(hub, id, 11);
    device.register(ENDPOINT, "key");
    device.connect().await.expect("connect");
    device
}

fn assert_channel_invariant(device: &Device) {
    assert_eq!(
        device.state() == DeviceState::Connected,
        device.has_channel(),
        "connected state must match channel presence"
    );
}

struct RefusingFactory;

#[async_trait]
impl ChannelFactory for RefusingFactory {
    async fn create(
        &self,
        endpoint: &str,
        _device_id: &str,
        _credential: &Credential,
    ) -> msim_channel::Result<Arc<dyn TelemetryChannel>> {
        Err(ChannelError::EndpointUnreachable {
            endpoint: endpoint.to_owned(),
        })
    }
}

#[tokio::test]
async fn meter_scenario_end_to_end() {
    let hub = LoopbackHub::new();
    hub.provision("meter-1", "key");
    let device = device(&hub, "meter-1", 3);
    assert_eq!(device.state(), DeviceState::New);
    assert_channel_invariant(&device);

    device.register(ENDPOINT, "key");
    assert_eq!(device.state(), DeviceState::Registered);
    assert_channel_invariant(&device);

    device.connect().await.unwrap();
    assert_eq!(device.state(), DeviceState::Connected);
    assert!(device.has_channel());

    let SendOutcome::Sent(first) = device.send_reading().await.unwrap() else {
        panic!("connected device must publish");
    };
    let published = hub.take_outbound("meter-1");
    assert_eq!(published.len(), 1);
    let decoded = Reading::decode(&published[0]).unwrap();
    assert_eq!(decoded.id, "meter-1");
    assert_eq!(decoded.temperature, first.temperature);
    assert!(decoded.voltage.is_finite());

    hub.enqueue_command("meter-1", "55").unwrap();
    assert_eq!(device.poll_inbound().await.unwrap(), PollOutcome::Override(55.0));
    assert_eq!(device.temperature_override(), Some(55.0));

    device.send_reading().await.unwrap();
    let published = hub.take_outbound("meter-1");
    assert_eq!(Reading::decode(&published[0]).unwrap().temperature, 55.0);

    device.disconnect().await;
    assert_eq!(device.state(), DeviceState::Registered);
    assert!(!device.has_channel());
}

#[tokio::test]
async fn connect_without_registration_fails_and_keeps_state() {
    let hub = LoopbackHub::new();
    let device = device(&hub, "meter-1", 1);
    device.install("garage");

    let err = device.connect().await.unwrap_err();
    assert!(matches!(err, DeviceError::NotRegistered { ref device_id } if device_id == "meter-1"));
    assert_eq!(device.state(), DeviceState::Installed);
    assert_channel_invariant(&device);
}

#[tokio::test]
async fn factory_failure_surfaces_as_channel_creation() {
    let device = Device::new(
        "meter-1",
        Arc::new(RefusingFactory),
        ReadingGenerator::seeded(ReadingProfile::default(), 1),
    );
    device.register("loopback://nowhere", "key");

    let err = device.connect().await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::ChannelCreation {
            source: ChannelError::EndpointUnreachable { .. },
            ..
        }
    ));
    assert_eq!(device.state(), DeviceState::Registered);
    assert_channel_invariant(&device);
}

#[tokio::test]
async fn disconnected_device_neither_sends_nor_receives() {
    let hub = LoopbackHub::new();
    let device = connected(&hub, "meter-1").await;
    hub.enqueue_command("meter-1", "12").unwrap();

    device.disconnect().await;
    assert_eq!(device.send_reading().await.unwrap(), SendOutcome::Skipped);
    assert_eq!(device.poll_inbound().await.unwrap(), PollOutcome::Skipped);
    assert_eq!(hub.sent_total("meter-1"), 0);
    assert_eq!(hub.pending_commands("meter-1"), 1);
    assert_eq!(device.temperature_override(), None);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let hub = LoopbackHub::new();
    let device = connected(&hub, "meter-1").await;

    device.disconnect().await;
    assert_eq!(device.state(), DeviceState::Registered);
    device.disconnect().await;
    assert_eq!(device.state(), DeviceState::Registered);
    assert_channel_invariant(&device);
}

#[tokio::test]
async fn disconnect_on_new_device_stays_new() {
    let hub = LoopbackHub::new();
    let device = device(&hub, "meter-1", 1);
    device.disconnect().await;
    assert_eq!(device.state(), DeviceState::New);
    assert_eq!(device.connection_state(), ConnectionState::New);
}

#[tokio::test]
async fn override_set_then_cancelled_by_non_numeric_commands() {
    let hub = LoopbackHub::new();
    let device = connected(&hub, "meter-1").await;

    for cancel in ["", "abc"] {
        hub.enqueue_command("meter-1", "37.2").unwrap();
        assert_eq!(device.poll_inbound().await.unwrap(), PollOutcome::Override(37.2));
        assert_eq!(device.temperature_override(), Some(37.2));
        assert_eq!(device.current_temperature(), 37.2);

        hub.enqueue_command("meter-1", cancel).unwrap();
        assert_eq!(device.poll_inbound().await.unwrap(), PollOutcome::Cleared);
        assert_eq!(device.temperature_override(), None);
        assert_eq!(device.last_received_raw().as_deref(), Some(cancel));
    }
    assert_eq!(hub.unacknowledged("meter-1"), 0);
}

#[tokio::test]
async fn failed_acknowledge_reports_applied_command_and_ignores_redelivery() {
    let hub = LoopbackHub::new();
    let device = connected(&hub, "meter-1").await;

    hub.enqueue_command("meter-1", "37.2").unwrap();
    hub.fail_next("meter-1", ChannelOperation::Acknowledge, 1);
    assert_eq!(
        device.poll_inbound().await.unwrap(),
        PollOutcome::Unacknowledged(Some(37.2))
    );
    assert_eq!(device.temperature_override(), Some(37.2));
    assert_eq!(hub.unacknowledged("meter-1"), 1);

    hub.enqueue_command("meter-1", "abc").unwrap();
    assert_eq!(device.poll_inbound().await.unwrap(), PollOutcome::Cleared);
    assert_eq!(device.temperature_override(), None);

    device.disconnect().await;
    device.connect().await.unwrap();
    assert_eq!(hub.pending_commands("meter-1"), 1);
    assert_eq!(device.poll_inbound().await.unwrap(), PollOutcome::Redelivered);
    assert_eq!(device.temperature_override(), None, "stale command must not return");
    assert_eq!(device.last_received_raw().as_deref(), Some("abc"));
    assert_eq!(hub.unacknowledged("meter-1"), 0);
    assert_eq!(device.poll_inbound().await.unwrap(), PollOutcome::Idle);
}

#[tokio::test]
async fn failed_acknowledge_of_cancel_is_still_reported() {
    let hub = LoopbackHub::new();
    let device = connected(&hub, "meter-1").await;

    hub.enqueue_command("meter-1", "12").unwrap();
    device.poll_inbound().await.unwrap();
    hub.enqueue_command("meter-1", "").unwrap();
    hub.fail_next("meter-1", ChannelOperation::Acknowledge, 1);
    assert_eq!(
        device.poll_inbound().await.unwrap(),
        PollOutcome::Unacknowledged(None)
    );
    assert_eq!(device.temperature_override(), None);
}

#[tokio::test]
async fn temperature_stays_in_range_without_override_and_exact_with_one() {
    let hub = LoopbackHub::new();
    let device = connected(&hub, "meter-1").await;
    for _ in 0..500 {
        let temperature = device.current_temperature();
        assert!((94.0..=105.0).contains(&temperature));
    }

    hub.enqueue_command("meter-1", "42.5").unwrap();
    device.poll_inbound().await.unwrap();
    for _ in 0..100 {
        assert_eq!(device.current_temperature(), 42.5);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_racing_send_and_poll_never_errors() {
    let hub = LoopbackHub::new();
    let device = connected(&hub, "meter-1").await;
    for value in 0..50 {
        hub.enqueue_command("meter-1", value.to_string()).unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let sender = device.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                sender.send_reading().await.expect("send never errors");
                tokio::task::yield_now().await;
            }
        }));
        let poller = device.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                poller.poll_inbound().await.expect("poll never errors");
                tokio::task::yield_now().await;
            }
        }));
    }
    tokio::task::yield_now().await;
    device.disconnect().await;
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(device.state(), DeviceState::Registered);
    assert_channel_invariant(&device);
    assert_eq!(hub.unacknowledged("meter-1"), 0);
}
