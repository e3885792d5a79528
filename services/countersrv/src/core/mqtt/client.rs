//! Managed MQTT broker client.
//!
//! One background event-loop task owns the broker session: it subscribes
//! the effective filter set on every ConnAck, routes publishes through the
//! topic registry into the reading bus, and paces reconnection attempts
//! with the configured delay. Messages that match no device or fail to
//! decode are counted and dropped; they never reach the dead-letter queue.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use super::topics::TopicRegistry;
use crate::core::config::MqttSettings;
use crate::core::reading::DeviceReading;
use crate::utils::{CounterSrvError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Ingestion counters surfaced on the status endpoints.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct MqttIngestStats {
    pub connected: bool,
    pub messages_received: u64,
    pub readings_emitted: u64,
    pub decode_failures: u64,
    pub unmatched_topics: u64,
    pub reconnect_attempts: u64,
    pub last_error: Option<String>,
}

/// MQTT collection plane: managed client plus message processing.
pub struct MqttIngest {
    settings: MqttSettings,
    registry: Arc<TopicRegistry>,
    readings: mpsc::Sender<DeviceReading>,
    stats: Arc<RwLock<MqttIngestStats>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttIngest {
    pub fn new(
        settings: MqttSettings,
        registry: TopicRegistry,
        readings: mpsc::Sender<DeviceReading>,
    ) -> Self {
        Self {
            settings,
            registry: Arc::new(registry),
            readings,
            stats: Arc::new(RwLock::new(MqttIngestStats::default())),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    fn build_options(&self) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(
            &self.settings.client_id,
            &self.settings.broker_host,
            self.settings.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) =
            (&self.settings.username, &self.settings.password)
        {
            options.set_credentials(username, password);
        }

        if self.settings.use_tls {
            let ca_path = self.settings.ca_cert.as_ref().ok_or_else(|| {
                CounterSrvError::ConfigError("mqtt.use_tls requires mqtt.ca_cert".to_string())
            })?;
            let ca = fs::read(ca_path).map_err(|e| {
                CounterSrvError::ConfigError(format!("failed to read CA file {ca_path}: {e}"))
            })?;
            options.set_transport(Transport::tls(ca, None, None));
        }

        Ok(options)
    }

    /// Start the broker session and its event-loop task.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.task.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let options = self.build_options()?;
        let (client, mut event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        let registry = self.registry.clone();
        let readings = self.readings.clone();
        let stats = self.stats.clone();
        let cancel = self.cancel.clone();
        let reconnect_delay = Duration::from_secs(self.settings.reconnect_delay_secs.max(1));
        let max_reconnect_attempts = self.settings.max_reconnect_attempts;
        let broker = format!(
            "{}:{}",
            self.settings.broker_host, self.settings.broker_port
        );

        let handle = tokio::spawn(async move {
            info!(broker, "mqtt event loop started");
            let mut consecutive_errors: u64 = 0;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = client.disconnect().await;
                        break;
                    }
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(broker, "mqtt connected");
                            consecutive_errors = 0;
                            {
                                let mut s = stats.write().await;
                                s.connected = true;
                                s.last_error = None;
                            }
                            for (filter, qos) in registry.subscriptions() {
                                if let Err(e) =
                                    client.subscribe(filter.clone(), qos_from_u8(*qos)).await
                                {
                                    error!(filter, error = %e, "mqtt subscribe failed");
                                } else {
                                    debug!(filter, qos, "subscribed");
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let delivered = handle_publish(
                                &registry,
                                &publish.topic,
                                &publish.payload,
                                Utc::now(),
                                &readings,
                                &stats,
                            )
                            .await;
                            if !delivered {
                                warn!("reading channel closed, mqtt event loop exiting");
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!(broker, "mqtt broker disconnected");
                            stats.write().await.connected = false;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            consecutive_errors += 1;
                            {
                                let mut s = stats.write().await;
                                s.connected = false;
                                s.reconnect_attempts += 1;
                                s.last_error = Some(e.to_string());
                            }
                            if max_reconnect_attempts > 0
                                && consecutive_errors >= u64::from(max_reconnect_attempts)
                            {
                                error!(
                                    broker,
                                    attempts = consecutive_errors,
                                    error = %e,
                                    "mqtt reconnect attempts exhausted, giving up"
                                );
                                break;
                            }
                            warn!(broker, error = %e, "mqtt connection error, retrying");
                            tokio::select! {
                                () = cancel.cancelled() => break,
                                () = sleep(reconnect_delay) => {}
                            }
                        }
                    }
                }
            }

            stats.write().await.connected = false;
            info!(broker, "mqtt event loop stopped");
        });

        *slot = Some(handle);
        Ok(())
    }

    /// Cancel the event loop and wait briefly for it to wind down.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }

    pub async fn stats(&self) -> MqttIngestStats {
        self.stats.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.stats.read().await.connected
    }

    pub fn device_count(&self) -> usize {
        self.registry.subscriptions().len()
    }
}

/// Route and decode one publish packet. Returns false only when the reading
/// bus is gone and the caller should stop.
pub(crate) async fn handle_publish(
    registry: &TopicRegistry,
    topic: &str,
    payload: &[u8],
    arrival: DateTime<Utc>,
    readings: &mpsc::Sender<DeviceReading>,
    stats: &RwLock<MqttIngestStats>,
) -> bool {
    stats.write().await.messages_received += 1;

    let Some(binding) = registry.resolve(topic) else {
        stats.write().await.unmatched_topics += 1;
        debug!(topic, "no device registered for topic");
        return true;
    };

    match binding.decode(payload, arrival) {
        Ok(reading) => {
            if readings.send(reading).await.is_err() {
                return false;
            }
            stats.write().await.readings_emitted += 1;
            true
        }
        Err(e) => {
            let mut s = stats.write().await;
            s.decode_failures += 1;
            s.last_error = Some(e.to_string());
            drop(s);
            warn!(topic, device_id = %binding.config.device_id, error = %e, "payload decode failed");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{MqttDataType, MqttDeviceConfig, PayloadFormat};

    fn registry() -> TopicRegistry {
        let devices = vec![MqttDeviceConfig {
            device_id: "sensor-1".to_string(),
            topics: vec!["factory/line1/+/counter".to_string()],
            format: PayloadFormat::Json,
            data_type: MqttDataType::Float32,
            qos: None,
            channel_path: Some("$.ch".to_string()),
            value_path: Some("$.v".to_string()),
            device_id_path: None,
            timestamp_path: None,
            scale_factor: 1.0,
            unit: None,
        }];
        TopicRegistry::build(&devices, 1).unwrap()
    }

    #[tokio::test]
    async fn test_handle_publish_routes_wildcard_topic() {
        let registry = registry();
        let (tx, mut rx) = mpsc::channel(8);
        let stats = RwLock::new(MqttIngestStats::default());

        let delivered = handle_publish(
            &registry,
            "factory/line1/A/counter",
            br#"{"ch":3,"v":12.5}"#,
            Utc::now(),
            &tx,
            &stats,
        )
        .await;
        assert!(delivered);

        let reading = rx.recv().await.unwrap();
        assert_eq!(reading.device_id, "sensor-1");
        assert_eq!(reading.channel, 3);
        assert_eq!(reading.processed_value, Some(12.5));

        let snapshot = stats.read().await.clone();
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.readings_emitted, 1);
        assert_eq!(snapshot.decode_failures, 0);
    }

    #[tokio::test]
    async fn test_handle_publish_counts_unmatched() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(8);
        let stats = RwLock::new(MqttIngestStats::default());

        let delivered = handle_publish(
            &registry,
            "plant/unrelated",
            b"{}",
            Utc::now(),
            &tx,
            &stats,
        )
        .await;
        assert!(delivered);

        let snapshot = stats.read().await.clone();
        assert_eq!(snapshot.unmatched_topics, 1);
        assert_eq!(snapshot.readings_emitted, 0);
    }

    #[tokio::test]
    async fn test_handle_publish_counts_decode_failures() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(8);
        let stats = RwLock::new(MqttIngestStats::default());

        let delivered = handle_publish(
            &registry,
            "factory/line1/A/counter",
            b"not json at all",
            Utc::now(),
            &tx,
            &stats,
        )
        .await;
        assert!(delivered);

        let snapshot = stats.read().await.clone();
        assert_eq!(snapshot.decode_failures, 1);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn test_handle_publish_reports_closed_bus() {
        let registry = registry();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let stats = RwLock::new(MqttIngestStats::default());

        let delivered = handle_publish(
            &registry,
            "factory/line1/A/counter",
            br#"{"ch":1,"v":1.0}"#,
            Utc::now(),
            &tx,
            &stats,
        )
        .await;
        assert!(!delivered);
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_harmless() {
        let (tx, _rx) = mpsc::channel(1);
        let settings = MqttSettings {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            client_id: "test".to_string(),
            username: None,
            password: None,
            use_tls: false,
            ca_cert: None,
            keep_alive_secs: 30,
            default_qos: 1,
            reconnect_delay_secs: 1,
            max_reconnect_attempts: 1,
        };
        let ingest = MqttIngest::new(settings, registry(), tx);
        ingest.stop().await;
        assert!(!ingest.is_connected().await);
    }
}
