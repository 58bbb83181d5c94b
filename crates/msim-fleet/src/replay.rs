//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Replay of scripted inbound commands into the loopback hub."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Newline-delimited JSON command scripts. Each non-blank line holds
//! `{"device": "...", "payload": "...", "delay_ms": N}` where `delay_ms`
//! is optional and applied before the command is enqueued.

use std::fs;
use std::path::Path;
use std::time::Duration;

use msim_channel::LoopbackHub;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::fleet::FleetError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandRecord {
    pub device: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

pub fn parse_commands(contents: &str) -> Result<Vec<CommandRecord>, FleetError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|source| FleetError::Script {
                line: index + 1,
                source,
            })
        })
        .collect()
}

pub fn load_commands<P: AsRef<Path>>(path: P) -> Result<Vec<CommandRecord>, FleetError> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_commands(&contents)
}

/// Enqueue each record on the hub, honouring its delay. Commands for devices
/// the hub does not know are logged and skipped. Returns the number enqueued.
pub async fn replay_commands(hub: &LoopbackHub, records: Vec<CommandRecord>) -> usize {
    let mut count = 0usize;
    for record in records {
        if let Some(delay) = record.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match hub.enqueue_command(&record.device, record.payload.clone()) {
            Ok(message_id) => {
                debug!(device_id = %record.device, %message_id, payload = %record.payload, "command replayed");
                count += 1;
            }
            Err(err) => {
                warn!(device_id = %record.device, error = %err, "command skipped");
            }
        }
    }
    count
}
