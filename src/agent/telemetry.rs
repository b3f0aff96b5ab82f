//! Synthetic sensor readings
//!
//! Randomness and wall-clock time are injected through [`RandomSource`] and
//! [`Clock`] so a run can be made fully deterministic.

use crate::transport::TelemetryMessage;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::ops::Range;

pub const TEMPERATURE_RANGE: Range<f64> = 20.0..35.0;
pub const HUMIDITY_RANGE: Range<f64> = 60.0..80.0;
/// Readings strictly above this raise `temperatureAlert`
pub const TEMPERATURE_ALERT_THRESHOLD: f64 = 30.0;
pub const TEMPERATURE_ALERT_PROPERTY: &str = "temperatureAlert";

/// Source of uniformly distributed readings
pub trait RandomSource: Send + Sync {
    /// Draw a value in `range` (start inclusive, end exclusive)
    fn sample(&mut self, range: Range<f64>) -> f64;
}

/// `StdRng`-backed source, optionally seeded for reproducible runs
pub struct StdRandomSource {
    rng: StdRng,
}

impl StdRandomSource {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::seeded)
    }
}

impl RandomSource for StdRandomSource {
    fn sample(&mut self, range: Range<f64>) -> f64 {
        self.rng.gen_range(range)
    }
}

/// Wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One reading, consumed once by a send
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn is_alert(&self) -> bool {
        self.temperature > TEMPERATURE_ALERT_THRESHOLD
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryBody<'a> {
    device_id: &'a str,
    temperature: f64,
    humidity: f64,
}

/// Draw a new sample: temperature first, then humidity
pub fn synthesize(
    device_id: &str,
    random: &mut dyn RandomSource,
    clock: &dyn Clock,
) -> TelemetrySample {
    let temperature = random.sample(TEMPERATURE_RANGE);
    let humidity = random.sample(HUMIDITY_RANGE);
    TelemetrySample {
        device_id: device_id.to_string(),
        temperature,
        humidity,
        timestamp: clock.now(),
    }
}

/// Build the wire message: JSON body plus the `temperatureAlert` property
pub fn format_message(sample: &TelemetrySample) -> Result<TelemetryMessage, serde_json::Error> {
    let body = serde_json::to_vec(&TelemetryBody {
        device_id: &sample.device_id,
        temperature: sample.temperature,
        humidity: sample.humidity,
    })?;

    Ok(TelemetryMessage::new(body)
        .with_property(TEMPERATURE_ALERT_PROPERTY, sample.is_alert().to_string()))
}
