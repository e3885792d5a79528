//! Latest-reading cache backing the HTTP data endpoints.
//!
//! Keyed by `(device_id, channel)`, last writer wins. Cleared on shutdown
//! or through `DELETE /data/cache`; never consulted by the write path.

use dashmap::DashMap;

use crate::core::reading::DeviceReading;

#[derive(Debug, Default)]
pub struct LatestReadingCache {
    entries: DashMap<(String, u32), DeviceReading>,
}

impl LatestReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, reading: &DeviceReading) {
        self.entries.insert(reading.key(), reading.clone());
    }

    /// All cached readings, ordered by device id then channel.
    pub fn all(&self) -> Vec<DeviceReading> {
        let mut readings: Vec<DeviceReading> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        readings.sort_by(|a, b| {
            a.device_id
                .cmp(&b.device_id)
                .then(a.channel.cmp(&b.channel))
        });
        readings
    }

    /// Cached readings for one device, ordered by channel.
    pub fn for_device(&self, device_id: &str) -> Vec<DeviceReading> {
        let mut readings: Vec<DeviceReading> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == device_id)
            .map(|e| e.value().clone())
            .collect();
        readings.sort_by_key(|r| r.channel);
        readings
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reading::Quality;
    use chrono::Utc;

    fn reading(device: &str, channel: u32, raw: i64) -> DeviceReading {
        DeviceReading {
            device_id: device.to_string(),
            channel,
            timestamp: Utc::now(),
            raw_value: raw,
            processed_value: Some(raw as f64),
            rate: None,
            quality: Quality::Good,
            unit: None,
        }
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = LatestReadingCache::new();
        cache.update(&reading("dev", 0, 1));
        cache.update(&reading("dev", 0, 2));

        let all = cache.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].raw_value, 2);
    }

    #[test]
    fn test_per_device_view_sorted_by_channel() {
        let cache = LatestReadingCache::new();
        cache.update(&reading("dev-a", 3, 30));
        cache.update(&reading("dev-a", 1, 10));
        cache.update(&reading("dev-b", 0, 0));

        let a = cache.for_device("dev-a");
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].channel, 1);
        assert_eq!(a[1].channel, 3);
    }

    #[test]
    fn test_clear() {
        let cache = LatestReadingCache::new();
        cache.update(&reading("dev", 0, 1));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
