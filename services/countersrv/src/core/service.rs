//! Supervisor: owns every long-lived component and their shutdown order.
//!
//! Readings from the Modbus pool and the MQTT ingest flow through one
//! pipeline task that applies validation, rate derivation and the latest-
//! reading cache before handing them to the batch writer. Shutdown stops
//! the producers first, drains the pipeline, flushes the writer and ends
//! with the dead-letter replay task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::core::cache::LatestReadingCache;
use crate::core::config::{AppConfig, ChannelConfig};
use crate::core::health::{DeviceHealth, DeviceHealthTracker};
use crate::core::modbus::ModbusDevicePool;
use crate::core::mqtt::{MqttIngest, MqttIngestStats, TopicRegistry};
use crate::core::reading::{DeviceReading, ReadingProcessor};
use crate::core::storage::{
    BatchWriter, BatchWriterConfig, BatchWriterStats, DeadLetterQueue, RetryPolicy, StorageSink,
};
use crate::utils::Result;

/// Capacity of the bus between producers and the pipeline task.
const READING_BUS_CAPACITY: usize = 1_024;

/// Interval of the periodic status summary log.
const STATUS_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Point-in-time service snapshot for the HTTP surface.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ServiceStatus {
    pub running: bool,
    pub start_time: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub modbus_devices: usize,
    pub connected_devices: usize,
    pub mqtt_configured: bool,
    pub mqtt_connected: bool,
    pub writer: BatchWriterStats,
    pub mqtt: Option<MqttIngestStats>,
    pub dlq_pending: Option<usize>,
    pub devices: Vec<DeviceHealth>,
}

impl std::fmt::Debug for CollectorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorService")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// The collection service.
pub struct CollectorService {
    config: AppConfig,
    sink: Arc<dyn StorageSink>,
    health: Arc<DeviceHealthTracker>,
    cache: Arc<LatestReadingCache>,
    processor: Arc<ReadingProcessor>,
    pool: Arc<ModbusDevicePool>,
    mqtt: Option<Arc<MqttIngest>>,
    writer: Arc<BatchWriter>,
    dlq: Option<Arc<DeadLetterQueue>>,
    started_at: DateTime<Utc>,
    running: AtomicBool,
    bus_tx: Mutex<Option<mpsc::Sender<DeviceReading>>>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    background_cancel: CancellationToken,
    dlq_task: Mutex<Option<JoinHandle<()>>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl CollectorService {
    /// Validate the configuration, construct and wire all components, and
    /// start collection.
    pub async fn start(config: AppConfig, sink: Arc<dyn StorageSink>) -> Result<Arc<Self>> {
        config.validate()?;

        let health = Arc::new(DeviceHealthTracker::new());
        let cache = Arc::new(LatestReadingCache::new());
        let processor = Arc::new(ReadingProcessor::new(config.processing.rate_window_secs));

        let dlq = if config.timescale.dlq_enabled {
            Some(DeadLetterQueue::open(&config.timescale.dlq_path).await?)
        } else {
            warn!("dead-letter queue disabled: terminally failed batches will be dropped");
            None
        };

        let writer = Arc::new(BatchWriter::start(
            sink.clone(),
            dlq.clone(),
            BatchWriterConfig::from_settings(&config.timescale),
        ));

        let (bus_tx, bus_rx) = mpsc::channel(READING_BUS_CAPACITY);

        let channel_limits: HashMap<(String, u32), ChannelConfig> = config
            .modbus_devices
            .iter()
            .filter(|d| d.enabled)
            .flat_map(|device| {
                device.channels.iter().filter(|c| c.enabled).map(|channel| {
                    (
                        (device.device_id.clone(), channel.channel),
                        channel.clone(),
                    )
                })
            })
            .collect();

        let pipeline = tokio::spawn(run_pipeline(
            bus_rx,
            channel_limits,
            processor.clone(),
            cache.clone(),
            writer.clone(),
        ));

        let pool = Arc::new(ModbusDevicePool::new(health.clone(), bus_tx.clone()));
        for device in config.modbus_devices.iter().filter(|d| d.enabled) {
            pool.add_device(device.clone());
        }
        info!(devices = pool.device_count(), "modbus pool started");

        let mqtt = match &config.mqtt {
            Some(mqtt_config) if !mqtt_config.devices.is_empty() => {
                let registry = TopicRegistry::build(
                    &mqtt_config.devices,
                    mqtt_config.settings.default_qos,
                )?;
                let ingest = Arc::new(MqttIngest::new(
                    mqtt_config.settings.clone(),
                    registry,
                    bus_tx.clone(),
                ));
                ingest.start().await?;
                info!(
                    broker = %mqtt_config.settings.broker_host,
                    devices = mqtt_config.devices.len(),
                    "mqtt ingest started"
                );
                Some(ingest)
            }
            _ => None,
        };

        let background_cancel = CancellationToken::new();
        let dlq_task = dlq.as_ref().map(|dlq| {
            dlq.clone().spawn_replay_task(
                sink.clone(),
                RetryPolicy::from_settings(&config.timescale),
                std::time::Duration::from_secs(config.timescale.dlq_replay_interval_secs),
                background_cancel.clone(),
            )
        });

        let status_task = spawn_status_task(
            health.clone(),
            writer.clone(),
            dlq.clone(),
            background_cancel.clone(),
        );

        info!(service = %config.service.name, "collection service started");
        Ok(Arc::new(Self {
            config,
            sink,
            health,
            cache,
            processor,
            pool,
            mqtt,
            writer,
            dlq,
            started_at: Utc::now(),
            running: AtomicBool::new(true),
            bus_tx: Mutex::new(Some(bus_tx)),
            pipeline: Mutex::new(Some(pipeline)),
            background_cancel,
            dlq_task: Mutex::new(dlq_task),
            status_task: Mutex::new(Some(status_task)),
        }))
    }

    /// Graceful shutdown: producers, pipeline, writer, replay task.
    /// Idempotent; the second call is a no-op.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down collection service");

        self.pool.stop_all().await;
        if let Some(mqtt) = &self.mqtt {
            mqtt.stop().await;
        }

        // Producers are gone; dropping our sender lets the pipeline drain.
        self.bus_tx.lock().await.take();
        if let Some(pipeline) = self.pipeline.lock().await.take() {
            let timeout = self.config.timescale.shutdown_timeout();
            if tokio::time::timeout(timeout, pipeline).await.is_err() {
                warn!("reading pipeline did not drain within {timeout:?}");
            }
        }

        self.writer.shutdown().await;

        self.background_cancel.cancel();
        if let Some(task) = self.dlq_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.status_task.lock().await.take() {
            let _ = task.await;
        }

        self.cache.clear();
        self.processor.clear();

        let stats = self.writer.stats().await;
        info!(
            written = stats.readings_written,
            failed = stats.readings_failed,
            dlq_pending = self.dlq.as_ref().map(|d| d.pending_count()).unwrap_or(0),
            "collection service stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> ServiceStatus {
        let mqtt_stats = match &self.mqtt {
            Some(mqtt) => Some(mqtt.stats().await),
            None => None,
        };
        ServiceStatus {
            running: self.is_running(),
            start_time: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            modbus_devices: self.pool.device_count(),
            connected_devices: self.health.connected_count(),
            mqtt_configured: self.mqtt.is_some(),
            mqtt_connected: mqtt_stats.as_ref().map(|s| s.connected).unwrap_or(false),
            writer: self.writer.stats().await,
            mqtt: mqtt_stats,
            dlq_pending: self.dlq.as_ref().map(|d| d.pending_count()),
            devices: self.health.snapshot(),
        }
    }

    /// Restart one device's poll task. False when the id is unknown.
    pub async fn restart_device(&self, device_id: &str) -> bool {
        self.pool.restart_device(device_id).await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn health(&self) -> &DeviceHealthTracker {
        &self.health
    }

    pub fn cache(&self) -> &LatestReadingCache {
        &self.cache
    }

    pub fn sink(&self) -> &Arc<dyn StorageSink> {
        &self.sink
    }

    pub async fn writer_stats(&self) -> BatchWriterStats {
        self.writer.stats().await
    }

    pub async fn mqtt_stats(&self) -> Option<MqttIngestStats> {
        match &self.mqtt {
            Some(mqtt) => Some(mqtt.stats().await),
            None => None,
        }
    }

    pub fn dlq_pending(&self) -> Option<usize> {
        self.dlq.as_ref().map(|d| d.pending_count())
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Periodic status summary in the log, independent of HTTP polling.
fn spawn_status_task(
    health: Arc<DeviceHealthTracker>,
    writer: Arc<BatchWriter>,
    dlq: Option<Arc<DeadLetterQueue>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let devices = health.snapshot();
                    let connected = devices.iter().filter(|d| d.is_connected).count();
                    let stats = writer.stats().await;
                    info!(
                        devices = devices.len(),
                        connected,
                        written = stats.readings_written,
                        queue_depth = stats.queue_depth,
                        dlq_pending = dlq.as_ref().map(|d| d.pending_count()).unwrap_or(0),
                        "status"
                    );
                }
            }
        }
    })
}

/// Fan-in task: validation, rate derivation, cache update, writer hand-off.
async fn run_pipeline(
    mut bus_rx: mpsc::Receiver<DeviceReading>,
    channel_limits: HashMap<(String, u32), ChannelConfig>,
    processor: Arc<ReadingProcessor>,
    cache: Arc<LatestReadingCache>,
    writer: Arc<BatchWriter>,
) {
    while let Some(reading) = bus_rx.recv().await {
        let limits = channel_limits.get(&(reading.device_id.clone(), reading.channel));
        let processed = processor.process(reading, limits);
        cache.update(&processed);
        if writer.write(processed).await.is_err() {
            warn!("batch writer stopped, reading pipeline exiting");
            break;
        }
    }
    info!("reading pipeline drained");
}
