//! Modbus device pool: one poll task per device.
//!
//! The pool owns every device context and is responsible for deterministic
//! shutdown; poll tasks hold only a cancellation token. A stuck device never
//! stalls another; each task sleeps and retries independently.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::ModbusConnection;
use crate::core::config::ModbusDeviceConfig;
use crate::core::health::DeviceHealthTracker;
use crate::core::reading::{assemble_counter, DeviceReading, Quality};

/// Grace period while waiting for cancelled poll tasks to quiesce.
const STOP_GRACE: Duration = Duration::from_millis(500);

struct DeviceContext {
    config: Arc<ModbusDeviceConfig>,
    connection: Arc<ModbusConnection>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns all Modbus device connections and their poll loops.
pub struct ModbusDevicePool {
    devices: DashMap<String, DeviceContext>,
    health: Arc<DeviceHealthTracker>,
    readings: mpsc::Sender<DeviceReading>,
}

impl ModbusDevicePool {
    pub fn new(health: Arc<DeviceHealthTracker>, readings: mpsc::Sender<DeviceReading>) -> Self {
        Self {
            devices: DashMap::new(),
            health,
            readings,
        }
    }

    /// Register a device and start polling it. Returns false on a duplicate
    /// device id.
    pub fn add_device(&self, config: ModbusDeviceConfig) -> bool {
        let device_id = config.device_id.clone();
        if self.devices.contains_key(&device_id) {
            warn!(device_id, "add_device rejected: duplicate id");
            return false;
        }

        let config = Arc::new(config);
        let connection = Arc::new(ModbusConnection::new(config.clone()));
        let cancel = CancellationToken::new();
        let task = spawn_poll_task(
            config.clone(),
            connection.clone(),
            self.health.clone(),
            self.readings.clone(),
            cancel.clone(),
        );

        info!(device_id, "modbus device added");
        self.devices.insert(
            device_id,
            DeviceContext {
                config,
                connection,
                cancel,
                task,
            },
        );
        true
    }

    /// Stop polling a device, drop its connection and health entry.
    pub async fn remove_device(&self, device_id: &str) -> bool {
        let Some((_, context)) = self.devices.remove(device_id) else {
            return false;
        };
        context.cancel.cancel();
        let _ = tokio::time::timeout(STOP_GRACE, context.task).await;
        context.connection.disconnect().await;
        self.health.reset(device_id);
        info!(device_id, "modbus device removed");
        true
    }

    /// Tear the device's poll task down and re-spawn it with a fresh
    /// cancellation handle and session.
    pub async fn restart_device(&self, device_id: &str) -> bool {
        // Take the context out of the map so no lock is held across awaits.
        let Some((key, context)) = self.devices.remove(device_id) else {
            return false;
        };

        context.cancel.cancel();
        let _ = tokio::time::timeout(STOP_GRACE, context.task).await;
        context.connection.disconnect().await;

        let cancel = CancellationToken::new();
        let task = spawn_poll_task(
            context.config.clone(),
            context.connection.clone(),
            self.health.clone(),
            self.readings.clone(),
            cancel.clone(),
        );
        self.devices.insert(
            key,
            DeviceContext {
                config: context.config,
                connection: context.connection,
                cancel,
                task,
            },
        );

        info!(device_id, "modbus device restarted");
        true
    }

    /// Cancel every poll task, wait for quiesce, then disconnect all.
    pub async fn stop_all(&self) {
        let device_ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        if device_ids.is_empty() {
            return;
        }
        info!(count = device_ids.len(), "stopping modbus poll tasks");

        for entry in self.devices.iter() {
            entry.cancel.cancel();
        }
        tokio::time::sleep(STOP_GRACE).await;

        let disconnects = self
            .devices
            .iter()
            .map(|entry| {
                let connection = entry.connection.clone();
                async move { connection.disconnect().await }
            })
            .collect::<Vec<_>>();
        futures::future::join_all(disconnects).await;

        self.devices.clear();
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

fn spawn_poll_task(
    config: Arc<ModbusDeviceConfig>,
    connection: Arc<ModbusConnection>,
    health: Arc<DeviceHealthTracker>,
    readings: mpsc::Sender<DeviceReading>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let device_id = config.device_id.clone();
        debug!(device_id, "poll task started");

        // Small random start offset so device fleets do not phase-align.
        let jitter = {
            let cap = config.poll_interval_ms.min(250).max(1);
            Duration::from_millis(rand::thread_rng().gen_range(0..cap))
        };
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(jitter) => {}
        }

        loop {
            match poll_cycle(&config, &connection, &health, &readings, &cancel).await {
                Ok(()) => {}
                Err(PollExit::Cancelled) => break,
                Err(PollExit::SubscriberGone) => {
                    debug!(device_id, "reading channel closed, poll task exiting");
                    break;
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(config.poll_interval()) => {}
            }
        }

        debug!(device_id, "poll task stopped");
    })
}

enum PollExit {
    Cancelled,
    SubscriberGone,
}

/// One pass over the device's enabled channels, in declaration order.
async fn poll_cycle(
    config: &Arc<ModbusDeviceConfig>,
    connection: &Arc<ModbusConnection>,
    health: &Arc<DeviceHealthTracker>,
    readings: &mpsc::Sender<DeviceReading>,
    cancel: &CancellationToken,
) -> std::result::Result<(), PollExit> {
    let device_id = &config.device_id;

    for channel in config.channels.iter().filter(|c| c.enabled) {
        if cancel.is_cancelled() {
            return Err(PollExit::Cancelled);
        }

        let (result, elapsed) = connection
            .read_registers(channel.start_register, channel.register_count)
            .await;

        match result.and_then(|words| assemble_counter(&words)) {
            Ok(raw_value) => {
                health.record_success(device_id, elapsed);

                let processed = raw_value as f64 * channel.scale_factor + channel.offset;
                let reading = DeviceReading {
                    device_id: device_id.clone(),
                    channel: channel.channel,
                    timestamp: chrono::Utc::now(),
                    raw_value,
                    processed_value: Some(processed),
                    rate: None,
                    // Bounds and change-rate checks happen downstream.
                    quality: Quality::Good,
                    unit: channel.unit(),
                };

                if readings.send(reading).await.is_err() {
                    return Err(PollExit::SubscriberGone);
                }
            }
            Err(err) => {
                health.record_failure(device_id, &err.to_string());
                debug!(
                    device_id,
                    channel = channel.channel,
                    error = %err,
                    "channel read failed"
                );
            }
        }
    }

    Ok(())
}
