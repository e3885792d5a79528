//! Per-device health and communication statistics.
//!
//! Concurrent map keyed by device id. Entries appear on the first read
//! attempt and live until an explicit reset or process exit. The offline
//! warning fires exactly once per transition to the threshold.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

/// Consecutive failures after which a device counts as offline.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Rolling response-time window length.
const RESPONSE_WINDOW: usize = 100;

/// Point-in-time health snapshot for one device.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeviceHealth {
    pub device_id: String,
    pub is_connected: bool,
    pub last_successful_read: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_reads: u64,
    pub successful_reads: u64,
    pub last_error: Option<String>,
    /// Successful reads as a percentage of all reads.
    pub success_rate: f64,
    /// Mean of the last 100 response durations, in milliseconds.
    pub avg_response_time_ms: f64,
}

#[derive(Debug, Default)]
struct HealthEntry {
    last_successful_read: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    total_reads: u64,
    successful_reads: u64,
    last_error: Option<String>,
    response_times_ms: VecDeque<f64>,
}

impl HealthEntry {
    fn snapshot(&self, device_id: &str) -> DeviceHealth {
        let success_rate = if self.total_reads > 0 {
            (self.successful_reads as f64 / self.total_reads as f64) * 100.0
        } else {
            0.0
        };
        let avg_response_time_ms = if self.response_times_ms.is_empty() {
            0.0
        } else {
            self.response_times_ms.iter().sum::<f64>() / self.response_times_ms.len() as f64
        };

        DeviceHealth {
            device_id: device_id.to_string(),
            is_connected: self.consecutive_failures < MAX_CONSECUTIVE_FAILURES,
            last_successful_read: self.last_successful_read,
            consecutive_failures: self.consecutive_failures,
            total_reads: self.total_reads,
            successful_reads: self.successful_reads,
            last_error: self.last_error.clone(),
            success_rate,
            avg_response_time_ms,
        }
    }
}

/// Concurrent per-device health tracker.
#[derive(Debug, Default)]
pub struct DeviceHealthTracker {
    entries: DashMap<String, HealthEntry>,
}

impl DeviceHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful read with its response duration.
    pub fn record_success(&self, device_id: &str, duration: Duration) {
        let mut entry = self.entries.entry(device_id.to_string()).or_default();
        entry.total_reads += 1;
        entry.successful_reads += 1;
        entry.consecutive_failures = 0;
        entry.last_successful_read = Some(Utc::now());
        entry.last_error = None;

        if entry.response_times_ms.len() == RESPONSE_WINDOW {
            entry.response_times_ms.pop_front();
        }
        entry
            .response_times_ms
            .push_back(duration.as_secs_f64() * 1_000.0);
    }

    /// Record a failed read. Returns true when this failure crossed the
    /// offline threshold (the warning is emitted here, once per transition).
    pub fn record_failure(&self, device_id: &str, error: &str) -> bool {
        let mut entry = self.entries.entry(device_id.to_string()).or_default();
        entry.total_reads += 1;
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.to_string());

        let went_offline = entry.consecutive_failures == MAX_CONSECUTIVE_FAILURES;
        if went_offline {
            warn!(
                device_id,
                consecutive_failures = entry.consecutive_failures,
                error,
                "device marked offline"
            );
        }
        went_offline
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.entries
            .get(device_id)
            .map(|e| e.consecutive_failures < MAX_CONSECUTIVE_FAILURES)
            .unwrap_or(false)
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceHealth> {
        self.entries.get(device_id).map(|e| e.snapshot(device_id))
    }

    /// Point-in-time snapshot of every tracked device, sorted by id.
    pub fn snapshot(&self) -> Vec<DeviceHealth> {
        let mut all: Vec<DeviceHealth> = self
            .entries
            .iter()
            .map(|e| e.value().snapshot(e.key()))
            .collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn connected_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.consecutive_failures < MAX_CONSECUTIVE_FAILURES)
            .count()
    }

    /// Remove a device entry entirely. Returns whether one existed.
    pub fn reset(&self, device_id: &str) -> bool {
        self.entries.remove(device_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_resets_failure_streak() {
        let tracker = DeviceHealthTracker::new();
        tracker.record_failure("dev", "timeout");
        tracker.record_failure("dev", "timeout");
        tracker.record_success("dev", Duration::from_millis(10));

        let health = tracker.get("dev").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.is_connected);
        assert_eq!(health.total_reads, 3);
        assert_eq!(health.successful_reads, 1);
        assert!(health.last_successful_read.is_some());
        assert_eq!(health.last_error, None);
    }

    #[test]
    fn test_offline_transition_fires_exactly_once() {
        let tracker = DeviceHealthTracker::new();

        for i in 1..MAX_CONSECUTIVE_FAILURES {
            assert!(
                !tracker.record_failure("dev", "refused"),
                "failure {} must not cross the threshold",
                i
            );
            assert!(tracker.is_connected("dev"));
        }

        // Fifth failure crosses the threshold.
        assert!(tracker.record_failure("dev", "refused"));
        assert!(!tracker.is_connected("dev"));

        // Sixth failure stays offline without re-firing.
        assert!(!tracker.record_failure("dev", "refused"));
        let health = tracker.get("dev").unwrap();
        assert_eq!(health.consecutive_failures, MAX_CONSECUTIVE_FAILURES + 1);
        assert_eq!(health.last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn test_recovery_after_offline() {
        let tracker = DeviceHealthTracker::new();
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            tracker.record_failure("dev", "refused");
        }
        assert!(!tracker.is_connected("dev"));

        tracker.record_success("dev", Duration::from_millis(5));
        assert!(tracker.is_connected("dev"));

        // A fresh streak can trip the warning again.
        for _ in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            assert!(!tracker.record_failure("dev", "refused"));
        }
        assert!(tracker.record_failure("dev", "refused"));
    }

    #[test]
    fn test_response_window_is_bounded() {
        let tracker = DeviceHealthTracker::new();
        for _ in 0..250 {
            tracker.record_success("dev", Duration::from_millis(10));
        }
        tracker.record_success("dev", Duration::from_millis(1_000));

        let health = tracker.get("dev").unwrap();
        // 99 * 10ms + 1 * 1000ms over a window of 100.
        assert!((health.avg_response_time_ms - 19.9).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate() {
        let tracker = DeviceHealthTracker::new();
        for _ in 0..3 {
            tracker.record_success("dev", Duration::from_millis(1));
        }
        tracker.record_failure("dev", "timeout");

        let health = tracker.get("dev").unwrap();
        assert!((health.success_rate - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_removes_entry() {
        let tracker = DeviceHealthTracker::new();
        tracker.record_success("dev", Duration::from_millis(1));
        assert!(tracker.reset("dev"));
        assert!(tracker.get("dev").is_none());
        assert!(!tracker.reset("dev"));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let tracker = DeviceHealthTracker::new();
        tracker.record_success("b-dev", Duration::from_millis(1));
        tracker.record_success("a-dev", Duration::from_millis(1));

        let all = tracker.snapshot();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].device_id, "a-dev");
        assert_eq!(all[1].device_id, "b-dev");
    }

    #[test]
    fn test_unknown_device_is_disconnected() {
        let tracker = DeviceHealthTracker::new();
        assert!(!tracker.is_connected("ghost"));
        assert_eq!(tracker.connected_count(), 0);
    }
}
