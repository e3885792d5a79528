//! Batching write pipeline in front of the storage sink.
//!
//! Producers feed a bounded queue; a full queue blocks the producer rather
//! than dropping readings. One consumer task accumulates a batch up to
//! `batch_size` or until `batch_timeout` has passed since the first entry
//! of the current batch, whichever comes first, then runs the batch through
//! the sink with the retry policy. Batches that still fail are handed to
//! the dead-letter queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use tracing::{debug, error, info, warn};

use super::dlq::DeadLetterQueue;
use super::{write_with_retry, RetryPolicy, StorageSink};
use crate::core::config::TimescaleSettings;
use crate::core::reading::DeviceReading;
use crate::utils::{CounterSrvError, Result};

/// Batch writer knobs, usually derived from [`TimescaleSettings`].
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub shutdown_timeout: Duration,
}

impl BatchWriterConfig {
    pub fn from_settings(settings: &TimescaleSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            batch_timeout: settings.batch_timeout(),
            queue_capacity: settings.queue_capacity.max(1),
            retry: RetryPolicy::from_settings(settings),
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

/// Writer statistics surfaced on the status endpoints.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct BatchWriterStats {
    pub readings_received: u64,
    pub readings_written: u64,
    pub readings_failed: u64,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub conflicts_skipped: u64,
    pub average_batch_size: f64,
    pub last_write_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Readings currently waiting in the queue.
    pub queue_depth: usize,
}

/// Bounded-queue batch writer with one consumer task.
pub struct BatchWriter {
    tx: mpsc::Sender<DeviceReading>,
    stats: Arc<RwLock<BatchWriterStats>>,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    queue_capacity: usize,
}

impl BatchWriter {
    /// Spawn the consumer task and return the writer handle.
    pub fn start(
        sink: Arc<dyn StorageSink>,
        dlq: Option<Arc<DeadLetterQueue>>,
        config: BatchWriterConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let stats = Arc::new(RwLock::new(BatchWriterStats::default()));
        let cancel = CancellationToken::new();

        let consumer = tokio::spawn(run_consumer(
            rx,
            sink,
            dlq,
            config.clone(),
            stats.clone(),
            cancel.clone(),
        ));

        Self {
            tx,
            stats,
            cancel,
            consumer: Mutex::new(Some(consumer)),
            shutdown_timeout: config.shutdown_timeout,
            queue_capacity: config.queue_capacity,
        }
    }

    /// Enqueue one reading. Blocks while the queue is full; fails only
    /// after the writer has stopped.
    pub async fn write(&self, reading: DeviceReading) -> Result<()> {
        self.tx.send(reading).await.map_err(|_| {
            CounterSrvError::ChannelError("batch writer is stopped".to_string())
        })?;
        self.stats.write().await.readings_received += 1;
        Ok(())
    }

    /// Enqueue a batch of readings, preserving their order.
    pub async fn write_batch(&self, readings: Vec<DeviceReading>) -> Result<()> {
        for reading in readings {
            self.write(reading).await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> BatchWriterStats {
        let mut snapshot = self.stats.read().await.clone();
        snapshot.queue_depth = self.queue_capacity - self.tx.capacity();
        snapshot
    }

    /// Flush what is in flight and stop the consumer, bounded by the
    /// shutdown timeout.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.consumer.lock().await.take() {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(_) => info!("batch writer drained and stopped"),
                Err(_) => warn!(
                    "batch writer did not drain within {:?}, aborting",
                    self.shutdown_timeout
                ),
            }
        }
    }
}

enum Wakeup {
    Item(Option<DeviceReading>),
    Deadline,
    Cancelled,
}

async fn run_consumer(
    mut rx: mpsc::Receiver<DeviceReading>,
    sink: Arc<dyn StorageSink>,
    dlq: Option<Arc<DeadLetterQueue>>,
    config: BatchWriterConfig,
    stats: Arc<RwLock<BatchWriterStats>>,
    cancel: CancellationToken,
) {
    let mut batch: Vec<DeviceReading> = Vec::with_capacity(config.batch_size);
    // Only meaningful while the batch is non-empty.
    let mut deadline = Instant::now();

    loop {
        let wakeup = if batch.is_empty() {
            tokio::select! {
                maybe = rx.recv() => Wakeup::Item(maybe),
                () = cancel.cancelled() => Wakeup::Cancelled,
            }
        } else {
            tokio::select! {
                maybe = rx.recv() => Wakeup::Item(maybe),
                () = tokio::time::sleep_until(deadline) => Wakeup::Deadline,
                () = cancel.cancelled() => Wakeup::Cancelled,
            }
        };

        match wakeup {
            Wakeup::Item(Some(reading)) => {
                if batch.is_empty() {
                    deadline = Instant::now() + config.batch_timeout;
                }
                batch.push(reading);
                if batch.len() >= config.batch_size {
                    flush(&mut batch, &sink, &dlq, &config, &stats).await;
                }
            }
            Wakeup::Item(None) => {
                // All producers dropped: final flush, then exit.
                flush(&mut batch, &sink, &dlq, &config, &stats).await;
                break;
            }
            Wakeup::Deadline => {
                flush(&mut batch, &sink, &dlq, &config, &stats).await;
            }
            Wakeup::Cancelled => {
                // Drain whatever is already queued, then flush and exit.
                while let Ok(reading) = rx.try_recv() {
                    batch.push(reading);
                    if batch.len() >= config.batch_size {
                        flush(&mut batch, &sink, &dlq, &config, &stats).await;
                    }
                }
                flush(&mut batch, &sink, &dlq, &config, &stats).await;
                break;
            }
        }
    }

    debug!("batch writer consumer exited");
}

async fn flush(
    batch: &mut Vec<DeviceReading>,
    sink: &Arc<dyn StorageSink>,
    dlq: &Option<Arc<DeadLetterQueue>>,
    config: &BatchWriterConfig,
    stats: &Arc<RwLock<BatchWriterStats>>,
) {
    if batch.is_empty() {
        return;
    }
    let readings = std::mem::take(batch);
    let batch_len = readings.len() as u64;

    match write_with_retry(sink.as_ref(), &readings, &config.retry).await {
        Ok(inserted) => {
            let mut s = stats.write().await;
            s.readings_written += batch_len;
            s.batches_written += 1;
            s.conflicts_skipped += batch_len - inserted;
            s.last_write_time = Some(Utc::now());
            let batches = s.batches_written as f64;
            s.average_batch_size =
                (s.average_batch_size * (batches - 1.0) + batch_len as f64) / batches;
            debug!(count = batch_len, inserted, "batch committed");
        }
        Err(e) => {
            {
                let mut s = stats.write().await;
                s.readings_failed += batch_len;
                s.batches_failed += 1;
                s.last_error = Some(e.to_string());
            }
            match dlq {
                Some(dlq) => match dlq.store(&readings, &e.to_string()).await {
                    Ok(path) => warn!(
                        count = batch_len,
                        file = %path.display(),
                        "batch spilled to dead-letter queue"
                    ),
                    Err(dlq_err) => error!(
                        count = batch_len,
                        error = %dlq_err,
                        "failed to spill batch to dead-letter queue, readings lost"
                    ),
                },
                None => error!(
                    count = batch_len,
                    error = %e,
                    "dead-letter queue disabled, failed batch dropped"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reading::Quality;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn reading(n: i64) -> DeviceReading {
        DeviceReading {
            device_id: "dev".to_string(),
            channel: 0,
            timestamp: Utc::now() + chrono::Duration::nanoseconds(n),
            raw_value: n,
            processed_value: Some(n as f64),
            rate: None,
            quality: Quality::Good,
            unit: None,
        }
    }

    fn config(batch_size: usize, timeout_ms: u64, capacity: usize) -> BatchWriterConfig {
        BatchWriterConfig {
            batch_size,
            batch_timeout: Duration::from_millis(timeout_ms),
            queue_capacity: capacity,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Sink that fails the first `fail_count` batches, can be paused, and
    /// records everything it accepted.
    struct MockSink {
        fail_remaining: AtomicU64,
        paused: AtomicBool,
        batches: Mutex<Vec<Vec<DeviceReading>>>,
    }

    impl MockSink {
        fn new(fail_count: u64) -> Arc<Self> {
            Arc::new(Self {
                fail_remaining: AtomicU64::new(fail_count),
                paused: AtomicBool::new(false),
                batches: Mutex::new(Vec::new()),
            })
        }

        async fn accepted(&self) -> usize {
            self.batches.lock().await.iter().map(Vec::len).sum()
        }

        async fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().await.iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl StorageSink for MockSink {
        async fn write_batch(&self, readings: &[DeviceReading]) -> Result<u64> {
            while self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(CounterSrvError::StorageError("injected failure".to_string()));
            }
            self.batches.lock().await.push(readings.to_vec());
            Ok(readings.len() as u64)
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let sink = MockSink::new(0);
        let writer = BatchWriter::start(sink.clone(), None, config(2, 60_000, 100));

        writer.write(reading(1)).await.unwrap();
        writer.write(reading(2)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.accepted().await < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(sink.batch_sizes().await, vec![2]);
        let stats = writer.stats().await;
        assert_eq!(stats.readings_written, 2);
        assert_eq!(stats.batches_written, 1);

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_on_timeout() {
        let sink = MockSink::new(0);
        let writer = BatchWriter::start(sink.clone(), None, config(100, 50, 100));

        writer.write(reading(1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.accepted().await < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(sink.batch_sizes().await, vec![1]);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_batches_never_exceed_batch_size() {
        let sink = MockSink::new(0);
        let writer = BatchWriter::start(sink.clone(), None, config(5, 50, 100));

        for i in 0..23 {
            writer.write(reading(i)).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.accepted().await < 23 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for size in sink.batch_sizes().await {
            assert!(size <= 5, "batch of {size} exceeds the configured maximum");
        }
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let sink = MockSink::new(2);
        let writer = BatchWriter::start(sink.clone(), None, config(1, 1_000, 10));

        writer.write(reading(1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.accepted().await < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = writer.stats().await;
        assert_eq!(stats.readings_written, 1);
        assert_eq!(stats.batches_failed, 0);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_failure_spills_to_dlq() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();
        // More failures than retry attempts: the batch is terminally failed.
        let sink = MockSink::new(100);
        let writer = BatchWriter::start(sink, Some(dlq.clone()), config(2, 1_000, 10));

        writer.write(reading(1)).await.unwrap();
        writer.write(reading(2)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while dlq.pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(dlq.pending_count(), 1);
        let stats = writer.stats().await;
        assert_eq!(stats.readings_failed, 2);
        assert_eq!(stats.batches_failed, 1);
        assert!(stats.last_error.is_some());

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_blocks_then_delivers_everything() {
        let sink = MockSink::new(0);
        sink.paused.store(true, Ordering::SeqCst);
        // Tiny queue so producers hit the wall quickly.
        let writer = Arc::new(BatchWriter::start(sink.clone(), None, config(4, 20, 4)));

        let producer = {
            let writer = writer.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    writer.write(reading(i)).await.unwrap();
                }
            })
        };

        // With the sink paused the producer cannot finish.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!producer.is_finished(), "producer should be blocked");

        sink.paused.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.accepted().await < 50 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Nothing dropped: everything produced was written.
        assert_eq!(sink.accepted().await, 50);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_in_flight_batch() {
        let sink = MockSink::new(0);
        let writer = BatchWriter::start(sink.clone(), None, config(100, 60_000, 100));

        writer.write(reading(1)).await.unwrap();
        writer.write(reading(2)).await.unwrap();
        writer.shutdown().await;

        assert_eq!(sink.accepted().await, 2);
        // Writes after shutdown fail cleanly.
        assert!(writer.write(reading(3)).await.is_err());
    }

    #[tokio::test]
    async fn test_order_preserved_within_batches() {
        let sink = MockSink::new(0);
        let writer = BatchWriter::start(sink.clone(), None, config(10, 50, 100));

        for i in 0..10 {
            writer.write(reading(i)).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.accepted().await < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let batches = sink.batches.lock().await;
        let raws: Vec<i64> = batches.iter().flatten().map(|r| r.raw_value).collect();
        assert_eq!(raws, (0..10).collect::<Vec<i64>>());

        drop(batches);
        writer.shutdown().await;
    }
}
