//! Topic filter validation, matching and device lookup.
//!
//! Exact topics resolve through a hash map; wildcard filters are scanned
//! linearly on a miss. Filters shared across devices subscribe at the
//! maximum QoS any owner requested.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::warn;

use super::decoder::DeviceBinding;
use crate::core::config::MqttDeviceConfig;
use crate::utils::{CounterSrvError, Result};

/// A filter is a wildcard iff it contains `+` or `#`.
pub fn is_wildcard(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// Validate MQTT filter syntax: `+` is a full single level, `#` a full,
/// terminal level. `##`, `++` and embedded wildcards are rejected.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(CounterSrvError::ConfigError(
            "empty topic filter".to_string(),
        ));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        match *level {
            "+" => {}
            "#" => {
                if index != levels.len() - 1 {
                    return Err(CounterSrvError::ConfigError(format!(
                        "invalid topic filter {filter}: '#' must be the last level"
                    )));
                }
            }
            other => {
                if other.contains('+') || other.contains('#') {
                    return Err(CounterSrvError::ConfigError(format!(
                        "invalid topic filter {filter}: wildcard must occupy a whole level"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Standard MQTT topic-filter matching.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Built once from the MQTT device set; read-only afterwards. A rebuild
/// replaces the whole registry atomically.
pub struct TopicRegistry {
    exact: HashMap<String, Arc<DeviceBinding>>,
    wildcards: Vec<(String, Arc<DeviceBinding>)>,
    subscriptions: Vec<(String, u8)>,
}

impl TopicRegistry {
    pub fn build(devices: &[MqttDeviceConfig], default_qos: u8) -> Result<Self> {
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();
        let mut qos_by_filter: BTreeMap<String, u8> = BTreeMap::new();

        for config in devices {
            let binding = Arc::new(DeviceBinding::compile(config.clone())?);
            let qos = config.qos.unwrap_or(default_qos);

            for topic in &config.topics {
                validate_filter(topic)?;

                let slot = qos_by_filter.entry(topic.clone()).or_insert(qos);
                *slot = (*slot).max(qos);

                if is_wildcard(topic) {
                    wildcards.push((topic.clone(), binding.clone()));
                } else if exact.contains_key(topic) {
                    warn!(
                        topic,
                        device_id = %config.device_id,
                        "duplicate exact topic, first registered device wins"
                    );
                } else {
                    exact.insert(topic.clone(), binding.clone());
                }
            }
        }

        Ok(Self {
            exact,
            wildcards,
            subscriptions: qos_by_filter.into_iter().collect(),
        })
    }

    /// Find the owning device for a published topic: exact match first,
    /// then the wildcard list in registration order.
    pub fn resolve(&self, topic: &str) -> Option<Arc<DeviceBinding>> {
        if let Some(binding) = self.exact.get(topic) {
            return Some(binding.clone());
        }
        self.wildcards
            .iter()
            .find(|(filter, _)| filter_matches(filter, topic))
            .map(|(_, binding)| binding.clone())
    }

    /// Filter set to subscribe on (re)connect, with aggregated QoS.
    pub fn subscriptions(&self) -> &[(String, u8)] {
        &self.subscriptions
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
