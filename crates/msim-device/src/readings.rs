//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reading generator and outbound telemetry record."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use bytes::Bytes;
use chrono::{DateTime, Utc};
use msim_common::config::SimulationConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Baselines and spread used when sampling readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingProfile {
    pub temperature_baseline: f64,
    pub temperature_offset_min: i32,
    pub temperature_offset_max: i32,
    pub voltage_baseline: f64,
}

impl Default for ReadingProfile {
    fn default() -> Self {
        Self {
            temperature_baseline: 100.0,
            temperature_offset_min: -6,
            temperature_offset_max: 5,
            voltage_baseline: 0.002,
        }
    }
}

impl From<&SimulationConfig> for ReadingProfile {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            temperature_baseline: config.temperature_baseline,
            temperature_offset_min: config.temperature_offset_min,
            temperature_offset_max: config.temperature_offset_max,
            voltage_baseline: config.voltage_baseline,
        }
    }
}

impl ReadingProfile {
    /// Inclusive offset range, ordered even when the fields were set reversed.
    pub fn offset_range(&self) -> (i32, i32) {
        let (min, max) = (self.temperature_offset_min, self.temperature_offset_max);
        (min.min(max), min.max(max))
    }

    /// Inclusive range every generated temperature falls into.
    pub fn temperature_bounds(&self) -> (f64, f64) {
        let (low, high) = self.offset_range();
        (
            self.temperature_baseline + f64::from(low),
            self.temperature_baseline + f64::from(high),
        )
    }

    /// Classify a temperature against the generated range.
    pub fn classify(&self, temperature: f64) -> TemperatureBand {
        let (low, high) = self.temperature_bounds();
        if temperature < low {
            TemperatureBand::Cold
        } else if temperature > high {
            TemperatureBand::Hot
        } else {
            TemperatureBand::Normal
        }
    }
}

/// Indicator derived from a temperature relative to the generator's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureBand {
    Cold,
    Normal,
    Hot,
}

/// Per-device sampler. Every call draws fresh values; nothing is cached.
#[derive(Debug)]
pub struct ReadingGenerator {
    profile: ReadingProfile,
    rng: Mutex<StdRng>,
}

impl ReadingGenerator {
    pub fn new(profile: ReadingProfile, rng: StdRng) -> Self {
        Self {
            profile,
            rng: Mutex::new(rng),
        }
    }

    pub fn seeded(profile: ReadingProfile, seed: u64) -> Self {
        Self::new(profile, StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy(profile: ReadingProfile) -> Self {
        Self::new(profile, StdRng::from_entropy())
    }

    /// Seeded when `seed` is present, entropy-backed otherwise.
    pub fn with_optional_seed(profile: ReadingProfile, seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(profile, seed),
            None => Self::from_entropy(profile),
        }
    }

    pub fn profile(&self) -> &ReadingProfile {
        &self.profile
    }

    /// Baseline plus a uniform integer offset from the inclusive profile range.
    pub fn sample_temperature(&self) -> f64 {
        let (low, high) = self.profile.offset_range();
        let offset = self.rng.lock().gen_range(low..=high);
        self.profile.temperature_baseline + f64::from(offset)
    }

    /// Baseline plus a uniform float in `[0, 1)`.
    pub fn sample_voltage(&self) -> f64 {
        let jitter: f64 = self.rng.lock().gen();
        self.profile.voltage_baseline + jitter
    }
}

/// Outbound telemetry record, serialized with the wire keys `id`, `time`, `temp`, `voltage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    #[serde(rename = "time", with = "msim_common::time::wire_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "temp")]
    pub temperature: f64,
    pub voltage: f64,
}

impl Reading {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
