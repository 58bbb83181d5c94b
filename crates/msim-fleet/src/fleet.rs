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

use indexmap::IndexMap;
use msim_channel::ChannelFactory;
use msim_common::config::AppConfig;
use msim_device::{Device, DeviceStatus, ReadingGenerator, ReadingProfile};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::metrics::{FleetCounters, FleetMetrics};
use crate::runner::{run_receive_loop, run_send_loop, ConnectPolicy, DeviceSchedule};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("device {0} is already part of the fleet")]
    DuplicateDevice(String),
    #[error("command script line {line} is invalid: {source}")]
    Script {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("command script unreadable: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct FleetMember {
    device: Arc<Device>,
    schedule: DeviceSchedule,
}

/// A set of simulated meters sharing one channel factory.
pub struct Fleet {
    factory: Arc<dyn ChannelFactory>,
    members: IndexMap<String, FleetMember>,
    connect_policy: ConnectPolicy,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("devices", &self.members.keys().collect::<Vec<_>>())
            .field("connect_policy", &self.connect_policy)
            .finish_non_exhaustive()
    }
}

impl Fleet {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            factory,
            members: IndexMap::new(),
            connect_policy: ConnectPolicy::default(),
        }
    }

    pub fn with_connect_policy(mut self, policy: ConnectPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    /// Build every configured device. Devices with a credential are
    /// registered, devices with a location are installed; none are connected.
    pub fn from_config(config: &AppConfig, factory: Arc<dyn ChannelFactory>) -> Self {
        let profile = ReadingProfile::from(&config.simulation);
        let mut fleet =
            Self::new(factory).with_connect_policy(ConnectPolicy::from(&config.simulation));

        for (index, (device_id, device_cfg)) in config.devices.iter().enumerate() {
            let generator =
                ReadingGenerator::with_optional_seed(profile, config.device_seed(index));
            let device = Device::new(device_id.clone(), fleet.factory.clone(), generator);
            if let Some(location) = &device_cfg.location {
                device.install(location.clone());
            }
            if let Some(credential) = &device_cfg.credential {
                device.register(config.endpoint_for(device_cfg), credential.clone());
            }
            let schedule = DeviceSchedule::from_config(device_cfg, &config.simulation);
            fleet.members.insert(
                device_id.clone(),
                FleetMember {
                    device: Arc::new(device),
                    schedule,
                },
            );
        }
        fleet
    }

    /// Create a device bound to this fleet's factory and add it.
    pub fn add_device(
        &mut self,
        device_id: &str,
        generator: ReadingGenerator,
        schedule: DeviceSchedule,
    ) -> Result<Arc<Device>, FleetError> {
        let device = Arc::new(Device::new(device_id, self.factory.clone(), generator));
        self.insert(device.clone(), schedule)?;
        Ok(device)
    }

    pub fn insert(&mut self, device: Arc<Device>, schedule: DeviceSchedule) -> Result<(), FleetError> {
        if self.members.contains_key(device.id()) {
            return Err(FleetError::DuplicateDevice(device.id().to_owned()));
        }
        self.members
            .insert(device.id().to_owned(), FleetMember { device, schedule });
        Ok(())
    }

    /// Drop a device from the fleet, disconnecting it first.
    pub async fn remove_device(&mut self, device_id: &str) -> Option<Arc<Device>> {
        let member = self.members.shift_remove(device_id)?;
        member.device.disconnect().await;
        Some(member.device)
    }

    pub fn device(&self, device_id: &str) -> Option<&Arc<Device>> {
        self.members.get(device_id).map(|member| &member.device)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn status(&self) -> Vec<DeviceStatus> {
        self.members
            .values()
            .map(|member| member.device.status())
            .collect()
    }

    /// Spawn a send task and a receive task per device.
    pub fn start(self) -> FleetHandle {
        let (shutdown_tx, _) = broadcast::channel(4);
        let counters = Arc::new(FleetCounters::default());
        let mut tasks = Vec::with_capacity(self.members.len() * 2);

        for (device_id, member) in &self.members {
            let span = info_span!("device", device_id = %device_id);
            tasks.push(tokio::spawn(
                run_send_loop(
                    member.device.clone(),
                    member.schedule.send_interval,
                    self.connect_policy,
                    counters.clone(),
                    shutdown_tx.subscribe(),
                )
                .instrument(span.clone()),
            ));
            tasks.push(tokio::spawn(
                run_receive_loop(
                    member.device.clone(),
                    member.schedule.receive_interval,
                    counters.clone(),
                    shutdown_tx.subscribe(),
                )
                .instrument(span),
            ));
        }

        info!(devices = self.members.len(), "fleet started");
        FleetHandle {
            shutdown: shutdown_tx,
            devices: self
                .members
                .into_iter()
                .map(|(id, member)| (id, member.device))
                .collect(),
            tasks,
            counters,
        }
    }
}

/// Handle to a running fleet.
#[derive(Debug)]
pub struct FleetHandle {
    shutdown: broadcast::Sender<()>,
    devices: IndexMap<String, Arc<Device>>,
    tasks: Vec<JoinHandle<()>>,
    counters: Arc<FleetCounters>,
}

impl FleetHandle {
    pub fn metrics(&self) -> FleetMetrics {
        self.counters.snapshot()
    }

    pub fn device(&self, device_id: &str) -> Option<&Arc<Device>> {
        self.devices.get(device_id)
    }

    pub fn status(&self) -> Vec<DeviceStatus> {
        self.devices.values().map(|device| device.status()).collect()
    }

    /// Stop every loop, then disconnect every device. Returns final device status.
    pub async fn shutdown(self) -> Vec<DeviceStatus> {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "device loop task failed");
            }
        }
        for device in self.devices.values() {
            device.disconnect().await;
        }
        info!(metrics = ?self.counters.snapshot(), "fleet shutdown complete");
        self.devices.values().map(|device| device.status()).collect()
    }
}
