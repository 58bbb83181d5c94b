//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process loopback hub standing in for the remote telemetry service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{ChannelError, ChannelFactory, Credential, InboundMessage, Result, TelemetryChannel};

const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Channel operation targeted by [`LoopbackHub::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOperation {
    /// [`TelemetryChannel::send`].
    Send,
    /// [`TelemetryChannel::receive`].
    Receive,
    /// [`TelemetryChannel::acknowledge`].
    Acknowledge,
}

/// Received-but-unacknowledged messages in delivery order, tagged with the
/// channel that received them.
#[derive(Debug, Default)]
struct InFlight {
    entries: Vec<(u64, InboundMessage)>,
}

impl InFlight {
    fn insert(&mut self, channel_id: u64, message: InboundMessage) {
        self.entries.push((channel_id, message));
    }

    fn remove(&mut self, id: &uuid::Uuid) -> bool {
        match self.entries.iter().position(|(_, message)| &message.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    fn take_for_channel(&mut self, channel_id: u64) -> Vec<InboundMessage> {
        let (taken, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|(owner, _)| *owner == channel_id);
        self.entries = kept;
        taken.into_iter().map(|(_, message)| message).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug)]
struct Mailbox {
    credential: Credential,
    inbound: VecDeque<InboundMessage>,
    in_flight: InFlight,
    outbound: VecDeque<Bytes>,
    sent_total: u64,
    faults: HashMap<ChannelOperation, u32>,
}

impl Mailbox {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            inbound: VecDeque::new(),
            in_flight: InFlight::default(),
            outbound: VecDeque::new(),
            sent_total: 0,
            faults: HashMap::new(),
        }
    }

    fn take_fault(&mut self, operation: ChannelOperation) -> Option<ChannelError> {
        let remaining = self.faults.get_mut(&operation)?;
        *remaining -= 1;
        if *remaining == 0 {
            self.faults.remove(&operation);
        }
        Some(ChannelError::Transport(format!(
            "injected {:?} fault",
            operation
        )))
    }
}

#[derive(Debug, Default)]
struct HubInner {
    endpoint: Option<String>,
    mailboxes: HashMap<String, Mailbox>,
}

/// In-process stand-in for the remote service: holds provisioned
/// credentials, per-device command queues, and everything devices published.
#[derive(Debug)]
pub struct LoopbackHub {
    inner: Mutex<HubInner>,
    outbound_capacity: usize,
    next_channel_id: AtomicU64,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::with_outbound_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }
}

impl LoopbackHub {
    /// Hub accepting any endpoint address.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hub retaining at most `capacity` published payloads per device.
    pub fn with_outbound_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            outbound_capacity: capacity.max(1),
            next_channel_id: AtomicU64::new(1),
        }
    }

    /// Restrict the hub to a single reachable endpoint address.
    pub fn set_endpoint(&self, address: impl Into<String>) {
        self.inner.lock().endpoint = Some(address.into());
    }

    /// Register (or re-key) a device identity. Queued state is preserved on re-key.
    pub fn provision(&self, device_id: impl Into<String>, credential: impl Into<Credential>) {
        let device_id = device_id.into();
        let credential = credential.into();
        let mut inner = self.inner.lock();
        match inner.mailboxes.entry(device_id.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().credential = credential,
            Entry::Vacant(entry) => {
                entry.insert(Mailbox::new(credential));
            }
        }
        debug!(device_id = %device_id, "loopback device provisioned");
    }

    /// Remove a device identity. Existing channels start failing with `Unauthorized`.
    pub fn revoke(&self, device_id: &str) -> bool {
        self.inner.lock().mailboxes.remove(device_id).is_some()
    }

    /// Queue a cloud-to-device command for `device_id`.
    pub fn enqueue_command(&self, device_id: &str, body: impl Into<Bytes>) -> Result<uuid::Uuid> {
        let mut inner = self.inner.lock();
        let mailbox = inner
            .mailboxes
            .get_mut(device_id)
            .ok_or_else(|| ChannelError::Unauthorized {
                device_id: device_id.to_owned(),
            })?;
        let message = InboundMessage::new(body);
        let id = message.id;
        mailbox.inbound.push_back(message);
        trace!(device_id, message_id = %id, "command queued");
        Ok(id)
    }

    /// Payloads published by `device_id`, oldest first.
    pub fn outbound(&self, device_id: &str) -> Vec<Bytes> {
        self.inner
            .lock()
            .mailboxes
            .get(device_id)
            .map(|mailbox| mailbox.outbound.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drain and return payloads published by `device_id`.
    pub fn take_outbound(&self, device_id: &str) -> Vec<Bytes> {
        self.inner
            .lock()
            .mailboxes
            .get_mut(device_id)
            .map(|mailbox| mailbox.outbound.drain(..).collect())
            .unwrap_or_default()
    }

    /// Total payloads ever accepted from `device_id`, including evicted ones.
    pub fn sent_total(&self, device_id: &str) -> u64 {
        self.inner
            .lock()
            .mailboxes
            .get(device_id)
            .map(|mailbox| mailbox.sent_total)
            .unwrap_or(0)
    }

    /// Commands queued but not yet received.
    pub fn pending_commands(&self, device_id: &str) -> usize {
        self.inner
            .lock()
            .mailboxes
            .get(device_id)
            .map(|mailbox| mailbox.inbound.len())
            .unwrap_or(0)
    }

    /// Commands received but not yet acknowledged.
    pub fn unacknowledged(&self, device_id: &str) -> usize {
        self.inner
            .lock()
            .mailboxes
            .get(device_id)
            .map(|mailbox| mailbox.in_flight.len())
            .unwrap_or(0)
    }

    /// Make the next `count` calls of `operation` by `device_id` fail with a transport error.
    pub fn fail_next(&self, device_id: &str, operation: ChannelOperation, count: u32) {
        if count == 0 {
            return;
        }
        if let Some(mailbox) = self.inner.lock().mailboxes.get_mut(device_id) {
            *mailbox.faults.entry(operation).or_insert(0) += count;
        }
    }

    /// Factory handing out channels bound to this hub.
    pub fn factory(self: &Arc<Self>) -> Arc<LoopbackFactory> {
        Arc::new(LoopbackFactory { hub: self.clone() })
    }

    fn authorize(&self, endpoint: &str, device_id: &str, credential: &Credential) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(expected) = &inner.endpoint {
            if expected != endpoint {
                return Err(ChannelError::EndpointUnreachable {
                    endpoint: endpoint.to_owned(),
                });
            }
        }
        match inner.mailboxes.get(device_id) {
            Some(mailbox) if &mailbox.credential == credential => Ok(()),
            _ => Err(ChannelError::Unauthorized {
                device_id: device_id.to_owned(),
            }),
        }
    }

    fn with_mailbox<T>(
        &self,
        device_id: &str,
        operation: ChannelOperation,
        closed: &AtomicBool,
        f: impl FnOnce(&mut Mailbox) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        // checked under the hub lock so a concurrent close cannot strand in-flight messages
        if closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let mailbox = inner
            .mailboxes
            .get_mut(device_id)
            .ok_or_else(|| ChannelError::Unauthorized {
                device_id: device_id.to_owned(),
            })?;
        if let Some(fault) = mailbox.take_fault(operation) {
            return Err(fault);
        }
        f(mailbox)
    }

    fn close_channel(&self, device_id: &str, channel_id: u64, closed: &AtomicBool) -> Option<usize> {
        let mut inner = self.inner.lock();
        if closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let Some(mailbox) = inner.mailboxes.get_mut(device_id) else {
            return Some(0);
        };
        let returned = mailbox.in_flight.take_for_channel(channel_id);
        let count = returned.len();
        for message in returned.into_iter().rev() {
            mailbox.inbound.push_front(message);
        }
        Some(count)
    }
}

/// [`ChannelFactory`] validating endpoint and credential against a [`LoopbackHub`].
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    hub: Arc<LoopbackHub>,
}

impl LoopbackFactory {
    /// Hub backing this factory.
    pub fn hub(&self) -> &Arc<LoopbackHub> {
        &self.hub
    }
}

#[async_trait]
impl ChannelFactory for LoopbackFactory {
    async fn create(
        &self,
        endpoint: &str,
        device_id: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn TelemetryChannel>> {
        self.hub.authorize(endpoint, device_id, credential)?;
        let channel_id = self.hub.next_channel_id.fetch_add(1, Ordering::Relaxed);
        debug!(device_id, endpoint, channel_id, "loopback channel created");
        Ok(Arc::new(LoopbackChannel {
            hub: self.hub.clone(),
            device_id: device_id.to_owned(),
            channel_id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Channel created by [`LoopbackFactory`].
#[derive(Debug)]
pub struct LoopbackChannel {
    hub: Arc<LoopbackHub>,
    device_id: String,
    channel_id: u64,
    closed: AtomicBool,
}

#[async_trait]
impl TelemetryChannel for LoopbackChannel {
    async fn send(&self, payload: Bytes) -> Result<()> {
        let capacity = self.hub.outbound_capacity;
        self.hub
            .with_mailbox(&self.device_id, ChannelOperation::Send, &self.closed, |mailbox| {
                if mailbox.outbound.len() == capacity {
                    mailbox.outbound.pop_front();
                }
                mailbox.outbound.push_back(payload);
                mailbox.sent_total += 1;
                Ok(())
            })
    }

    async fn receive(&self) -> Result<Option<InboundMessage>> {
        let channel_id = self.channel_id;
        self.hub
            .with_mailbox(&self.device_id, ChannelOperation::Receive, &self.closed, |mailbox| {
                let Some(message) = mailbox.inbound.pop_front() else {
                    return Ok(None);
                };
                mailbox.in_flight.insert(channel_id, message.clone());
                Ok(Some(message))
            })
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<()> {
        self.hub
            .with_mailbox(&self.device_id, ChannelOperation::Acknowledge, &self.closed, |mailbox| {
                if mailbox.in_flight.remove(&message.id) {
                    Ok(())
                } else {
                    Err(ChannelError::UnknownMessage {
                        message_id: message.id,
                    })
                }
            })
    }

    async fn close(&self) -> Result<()> {
        let Some(requeued) = self
            .hub
            .close_channel(&self.device_id, self.channel_id, &self.closed)
        else {
            return Ok(());
        };
        debug!(
            device_id = %self.device_id,
            channel_id = self.channel_id,
            requeued,
            "loopback channel closed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(hub: &Arc<LoopbackHub>, device_id: &str) -> Arc<dyn TelemetryChannel> {
        hub.provision(device_id, "key");
        hub.factory()
            .create("loopback://any", device_id, &Credential::from("key"))
            .await
            .expect("channel created")
    }

    #[tokio::test]
    async fn rejects_unknown_device_and_wrong_key() {
        let hub = LoopbackHub::new();
        hub.provision("meter-1", "right");
        let factory = hub.factory();

        let unknown = factory
            .create("loopback://any", "meter-2", &Credential::from("right"))
            .await;
        assert!(matches!(unknown, Err(ChannelError::Unauthorized { .. })));

        let wrong = factory
            .create("loopback://any", "meter-1", &Credential::from("wrong"))
            .await;
        assert!(matches!(wrong, Err(ChannelError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn pinned_endpoint_rejects_other_addresses() {
        let hub = LoopbackHub::new();
        hub.set_endpoint("loopback://hub-a");
        hub.provision("meter-1", "key");
        let result = hub
            .factory()
            .create("loopback://hub-b", "meter-1", &Credential::from("key"))
            .await;
        assert!(matches!(
            result,
            Err(ChannelError::EndpointUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn send_records_outbound_with_bounded_history() {
        let hub = Arc::new(LoopbackHub::with_outbound_capacity(2));
        let channel = connected(&hub, "meter-1").await;
        for body in ["a", "b", "c"] {
            channel.send(Bytes::from(body)).await.unwrap();
        }
        assert_eq!(
            hub.outbound("meter-1"),
            vec![Bytes::from("b"), Bytes::from("c")]
        );
        assert_eq!(hub.sent_total("meter-1"), 3);
        assert_eq!(hub.take_outbound("meter-1").len(), 2);
        assert!(hub.outbound("meter-1").is_empty());
    }

    #[tokio::test]
    async fn receive_then_acknowledge_clears_in_flight() {
        let hub = LoopbackHub::new();
        let channel = connected(&hub, "meter-1").await;
        assert!(channel.receive().await.unwrap().is_none());

        hub.enqueue_command("meter-1", "55").unwrap();
        let message = channel.receive().await.unwrap().expect("command delivered");
        assert_eq!(message.text(), "55");
        assert_eq!(hub.pending_commands("meter-1"), 0);
        assert_eq!(hub.unacknowledged("meter-1"), 1);

        channel.acknowledge(&message).await.unwrap();
        assert_eq!(hub.unacknowledged("meter-1"), 0);
        assert!(matches!(
            channel.acknowledge(&message).await,
            Err(ChannelError::UnknownMessage { .. })
        ));
    }

    #[tokio::test]
    async fn close_requeues_unacknowledged_and_rejects_calls() {
        let hub = LoopbackHub::new();
        let channel = connected(&hub, "meter-1").await;
        hub.enqueue_command("meter-1", "first").unwrap();
        hub.enqueue_command("meter-1", "second").unwrap();
        let _held = channel.receive().await.unwrap().unwrap();

        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(hub.pending_commands("meter-1"), 2);
        assert_eq!(hub.unacknowledged("meter-1"), 0);
        assert_eq!(channel.send(Bytes::from("x")).await, Err(ChannelError::Closed));
        assert_eq!(channel.receive().await, Err(ChannelError::Closed));

        let reopened = connected(&hub, "meter-1").await;
        let redelivered = reopened.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.text(), "first");
    }

    #[tokio::test]
    async fn injected_faults_fire_once_per_count() {
        let hub = LoopbackHub::new();
        let channel = connected(&hub, "meter-1").await;
        hub.fail_next("meter-1", ChannelOperation::Send, 1);

        let first = channel.send(Bytes::from("x")).await;
        assert!(matches!(first, Err(ChannelError::Transport(_))));
        channel.send(Bytes::from("y")).await.unwrap();
        assert_eq!(hub.outbound("meter-1"), vec![Bytes::from("y")]);
    }

    #[tokio::test]
    async fn revoked_device_loses_access() {
        let hub = LoopbackHub::new();
        let channel = connected(&hub, "meter-1").await;
        assert!(hub.revoke("meter-1"));
        assert!(matches!(
            channel.send(Bytes::from("x")).await,
            Err(ChannelError::Unauthorized { .. })
        ));
        assert!(hub.enqueue_command("meter-1", "1").is_err());
    }
}
