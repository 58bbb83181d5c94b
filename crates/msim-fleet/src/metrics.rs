//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Atomic counters for fleet send and receive loops."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};

use msim_device::{PollOutcome, SendOutcome};
use serde::Serialize;

/// Snapshot of fleet loop activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FleetMetrics {
    /// Readings handed to a channel.
    pub sent: u64,
    /// Send ticks that found no usable channel.
    pub send_skipped: u64,
    /// Inbound commands processed.
    pub commands_received: u64,
    pub overrides_applied: u64,
    pub overrides_cleared: u64,
    /// Channel errors returned by send or poll, plus commands applied but not acknowledged.
    pub loop_failures: u64,
    /// Connect attempts that failed.
    pub connect_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct FleetCounters {
    sent: AtomicU64,
    send_skipped: AtomicU64,
    commands_received: AtomicU64,
    overrides_applied: AtomicU64,
    overrides_cleared: AtomicU64,
    loop_failures: AtomicU64,
    connect_failures: AtomicU64,
}

impl FleetCounters {
    pub(crate) fn record_send(&self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Sent(_) => self.sent.fetch_add(1, Ordering::Relaxed),
            SendOutcome::Skipped => self.send_skipped.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_poll(&self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Override(_) => {
                self.commands_received.fetch_add(1, Ordering::Relaxed);
                self.overrides_applied.fetch_add(1, Ordering::Relaxed);
            }
            PollOutcome::Cleared => {
                self.commands_received.fetch_add(1, Ordering::Relaxed);
                self.overrides_cleared.fetch_add(1, Ordering::Relaxed);
            }
            PollOutcome::Unacknowledged(applied) => {
                self.commands_received.fetch_add(1, Ordering::Relaxed);
                match applied {
                    Some(_) => self.overrides_applied.fetch_add(1, Ordering::Relaxed),
                    None => self.overrides_cleared.fetch_add(1, Ordering::Relaxed),
                };
                self.loop_failures.fetch_add(1, Ordering::Relaxed);
            }
            PollOutcome::Idle | PollOutcome::Skipped | PollOutcome::Redelivered => {}
        }
    }

    pub(crate) fn record_loop_failure(&self) {
        self.loop_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> FleetMetrics {
        FleetMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            send_skipped: self.send_skipped.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            overrides_applied: self.overrides_applied.load(Ordering::Relaxed),
            overrides_cleared: self.overrides_cleared.load(Ordering::Relaxed),
            loop_failures: self.loop_failures.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}
