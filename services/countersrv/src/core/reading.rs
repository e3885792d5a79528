//! Canonical reading record, quality tags and the validation pipeline.
//!
//! Producers (Modbus poll loops, MQTT decoding) emit readings tagged `Good`;
//! the [`ReadingProcessor`] downstream applies bounds and change-rate checks,
//! derives the per-channel rate and keeps emit timestamps strictly monotone
//! per `(device_id, channel)` so the storage primary key stays unique.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::config::ChannelConfig;
use crate::utils::{CounterSrvError, Result};

/// Minimum age of the previous sample before a rate is derived.
pub const MIN_RATE_WINDOW_SECS: f64 = 10.0;

/// 32-bit counter range, used for wrap-around arithmetic.
const COUNTER_RANGE: i64 = 1 << 32;

/// A drop from above this raw value is a candidate wrap rather than a reset.
const COUNTER_WRAP_THRESHOLD: i64 = (COUNTER_RANGE / 10) * 9;

/// Data quality attached to every reading and preserved to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    Unavailable,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
            Quality::Unavailable => "unavailable",
        }
    }
}

/// One normalized counter sample.
///
/// `processed_value` is present iff quality is `Good` or `Uncertain`;
/// `rate` only when a previous reading exists inside the rate window.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceReading {
    pub device_id: String,
    pub channel: u32,
    pub timestamp: DateTime<Utc>,
    /// Unsigned 32-bit counter held in a 64-bit field; never negative.
    pub raw_value: i64,
    pub processed_value: Option<f64>,
    /// Derived units per second over the configured window.
    pub rate: Option<f64>,
    pub quality: Quality,
    pub unit: Option<String>,
}

impl DeviceReading {
    /// Cache/history key.
    pub fn key(&self) -> (String, u32) {
        (self.device_id.clone(), self.channel)
    }
}

/// Assemble register words into a counter value, low word first.
///
/// One register is the value itself; two combine as `(high << 16) | low`;
/// four extend the same little-word-first layout to 64 bits.
pub fn assemble_counter(words: &[u16]) -> Result<i64> {
    match words {
        [single] => Ok(i64::from(*single)),
        [low, high] => Ok((i64::from(*high) << 16) | i64::from(*low)),
        [w0, w1, w2, w3] => {
            let value = (u64::from(*w3) << 48)
                | (u64::from(*w2) << 32)
                | (u64::from(*w1) << 16)
                | u64::from(*w0);
            Ok(value as i64)
        }
        other => Err(CounterSrvError::ModbusError(format!(
            "unsupported register count {} for counter assembly",
            other.len()
        ))),
    }
}

#[derive(Debug, Clone, Copy)]
struct PrevSample {
    timestamp: DateTime<Utc>,
    raw_value: i64,
    processed_value: f64,
}

/// Stateful validation and rate derivation, keyed by `(device_id, channel)`.
pub struct ReadingProcessor {
    window_secs: f64,
    history: DashMap<(String, u32), PrevSample>,
}

impl ReadingProcessor {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs: window_secs as f64,
            history: DashMap::new(),
        }
    }

    /// Validate a reading against its channel limits (when known) and attach
    /// the derived rate. Readings without limits (MQTT devices) only get
    /// rate derivation.
    pub fn process(
        &self,
        mut reading: DeviceReading,
        limits: Option<&ChannelConfig>,
    ) -> DeviceReading {
        if reading.quality == Quality::Unavailable {
            reading.processed_value = None;
            reading.rate = None;
            return reading;
        }

        let key = reading.key();

        // Keep the emit timestamp strictly monotone per channel so the
        // storage primary key (timestamp, device_id, channel) stays unique.
        if let Some(prev) = self.history.get(&key) {
            if reading.timestamp <= prev.timestamp {
                reading.timestamp = prev.timestamp + ChronoDuration::nanoseconds(1);
            }
        }

        let processed = reading
            .processed_value
            .unwrap_or(reading.raw_value as f64);

        // Bounds check first: a violation is Bad and clears the processed
        // value, but the reading is still written (the database is the
        // record of truth, quality tag included).
        if let Some(cfg) = limits {
            let below = cfg.min_value.is_some_and(|min| processed < min);
            let above = cfg.max_value.is_some_and(|max| processed > max);
            if below || above {
                reading.quality = Quality::Bad;
                reading.processed_value = None;
                reading.rate = None;
                return reading;
            }
        }

        reading.rate = None;
        if let Some(prev) = self.history.get(&key).map(|p| *p) {
            let dt = (reading.timestamp - prev.timestamp)
                .num_nanoseconds()
                .map(|ns| ns as f64 / 1e9)
                .unwrap_or(f64::MAX);

            match counter_delta(prev.raw_value, reading.raw_value) {
                CounterDelta::Forward(delta_raw) => {
                    let scale = limits.map_or(1.0, |cfg| cfg.scale_factor);
                    let delta_processed = if limits.is_some() {
                        delta_raw as f64 * scale
                    } else {
                        processed - prev.processed_value
                    };

                    if dt >= MIN_RATE_WINDOW_SECS && dt <= self.window_secs {
                        reading.rate = Some(delta_processed / dt);
                    }

                    if let Some(max_change) = limits.and_then(|cfg| cfg.max_change_rate) {
                        if dt > 0.0 && delta_processed.abs() > max_change * dt {
                            reading.quality = Quality::Uncertain;
                        }
                    }
                }
                CounterDelta::Reset => {
                    // Counter went backwards without a plausible wrap.
                    if reading.quality == Quality::Good {
                        reading.quality = Quality::Uncertain;
                    }
                }
            }
        }

        self.history.insert(
            key,
            PrevSample {
                timestamp: reading.timestamp,
                raw_value: reading.raw_value,
                processed_value: processed,
            },
        );

        reading
    }

    /// Drop the rate/validation history for one device.
    pub fn forget_device(&self, device_id: &str) {
        self.history.retain(|(id, _), _| id != device_id);
    }

    pub fn clear(&self) {
        self.history.clear();
    }
}

enum CounterDelta {
    /// Monotone step (wrap-adjusted when applicable).
    Forward(i64),
    /// Backwards movement treated as a counter reset.
    Reset,
}

/// Wrap-around policy: a drop from near the top of the 32-bit range that
/// exceeds half the range is a wrap (delta gains 2^32); any other backwards
/// movement is a reset.
fn counter_delta(prev: i64, curr: i64) -> CounterDelta {
    if curr >= prev {
        return CounterDelta::Forward(curr - prev);
    }
    if prev > COUNTER_WRAP_THRESHOLD && prev - curr > COUNTER_RANGE / 2 {
        CounterDelta::Forward(curr + COUNTER_RANGE - prev)
    } else {
        CounterDelta::Reset
    }
}
