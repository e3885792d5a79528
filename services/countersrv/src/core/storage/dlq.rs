//! File-backed dead-letter queue for terminally failed batches.
//!
//! Each failed batch becomes one self-describing JSON file under the spool
//! directory: written to a `.tmp` name, fsynced, then renamed to its final
//! time-ordered name. A background task replays the oldest files through
//! the sink and deletes them on success; files that keep failing stay put.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{write_with_retry, RetryPolicy, StorageSink};
use crate::core::reading::DeviceReading;
use crate::utils::{CounterSrvError, Result};

const SPOOL_EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "tmp";
const CORRUPT_EXTENSION: &str = "corrupt";

/// On-disk record: the batch plus failure metadata.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLetterBatch {
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    pub count: usize,
    pub readings: Vec<DeviceReading>,
}

/// Outcome of one replay pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayOutcome {
    pub replayed_files: usize,
    pub replayed_readings: usize,
    /// True when a file failed and the pass stopped early.
    pub stopped_on_failure: bool,
}

/// Durable spool of failed batches.
pub struct DeadLetterQueue {
    path: PathBuf,
    sequence: AtomicU64,
    pending: AtomicUsize,
}

impl DeadLetterQueue {
    /// Open (and create) the spool directory, counting any files left over
    /// from a previous run.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| CounterSrvError::DlqError(format!("create {}: {e}", path.display())))?;

        let existing = list_spool_files(&path).await?;
        if !existing.is_empty() {
            info!(
                count = existing.len(),
                path = %path.display(),
                "dead-letter queue has batches from a previous run"
            );
        }

        Ok(Arc::new(Self {
            pending: AtomicUsize::new(existing.len()),
            sequence: AtomicU64::new(0),
            path,
        }))
    }

    /// Number of spooled, unreplayed batch files.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spool one failed batch atomically. Returns the final file path.
    pub async fn store(&self, readings: &[DeviceReading], reason: &str) -> Result<PathBuf> {
        let record = DeadLetterBatch {
            failed_at: Utc::now(),
            reason: reason.to_string(),
            count: readings.len(),
            readings: readings.to_vec(),
        };
        let payload = serde_json::to_vec_pretty(&record)
            .map_err(|e| CounterSrvError::DlqError(format!("serialize batch: {e}")))?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let stem = format!(
            "batch-{}-{:06}",
            record.failed_at.format("%Y%m%dT%H%M%S%6fZ"),
            sequence
        );
        let tmp_path = self.path.join(format!("{stem}.{TMP_EXTENSION}"));
        let final_path = self.path.join(format!("{stem}.{SPOOL_EXTENSION}"));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| CounterSrvError::DlqError(format!("create {}: {e}", tmp_path.display())))?;
        file.write_all(&payload)
            .await
            .map_err(|e| CounterSrvError::DlqError(format!("write {}: {e}", tmp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| CounterSrvError::DlqError(format!("fsync {}: {e}", tmp_path.display())))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| {
                CounterSrvError::DlqError(format!("rename to {}: {e}", final_path.display()))
            })?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        debug!(file = %final_path.display(), count = record.count, "batch spooled");
        Ok(final_path)
    }

    /// Replay spooled batches oldest-first. Stops at the first file that
    /// still fails after retries, leaving it (and everything newer) in
    /// place for the next pass.
    pub async fn replay_once(
        &self,
        sink: &dyn StorageSink,
        policy: &RetryPolicy,
    ) -> Result<ReplayOutcome> {
        let mut files = list_spool_files(&self.path).await?;
        files.sort();

        let mut outcome = ReplayOutcome::default();
        for file in files {
            let bytes = match tokio::fs::read(&file).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "failed to read spool file");
                    outcome.stopped_on_failure = true;
                    break;
                }
            };

            let record: DeadLetterBatch = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    // Quarantine so one bad file cannot wedge the replay loop.
                    error!(file = %file.display(), error = %e, "corrupt spool file, quarantining");
                    let quarantined = file.with_extension(CORRUPT_EXTENSION);
                    if tokio::fs::rename(&file, &quarantined).await.is_ok() {
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    continue;
                }
            };

            match write_with_retry(sink, &record.readings, policy).await {
                Ok(_) => {
                    if let Err(e) = tokio::fs::remove_file(&file).await {
                        warn!(file = %file.display(), error = %e, "replayed batch but could not delete file");
                    } else {
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    outcome.replayed_files += 1;
                    outcome.replayed_readings += record.count;
                    debug!(file = %file.display(), count = record.count, "batch replayed");
                }
                Err(e) => {
                    debug!(file = %file.display(), error = %e, "replay failed, leaving file in place");
                    outcome.stopped_on_failure = true;
                    break;
                }
            }
        }

        if outcome.replayed_files > 0 {
            info!(
                files = outcome.replayed_files,
                readings = outcome.replayed_readings,
                pending = self.pending_count(),
                "dead-letter replay pass finished"
            );
        }
        Ok(outcome)
    }

    /// Spawn the periodic replay task.
    pub fn spawn_replay_task(
        self: Arc<Self>,
        sink: Arc<dyn StorageSink>,
        policy: RetryPolicy,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dlq = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if dlq.pending_count() == 0 {
                            continue;
                        }
                        if let Err(e) = dlq.replay_once(sink.as_ref(), &policy).await {
                            warn!(error = %e, "dead-letter replay pass failed");
                        }
                    }
                }
            }
            debug!("dead-letter replay task stopped");
        })
    }
}

async fn list_spool_files(path: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| CounterSrvError::DlqError(format!("read {}: {e}", path.display())))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CounterSrvError::DlqError(format!("scan {}: {e}", path.display())))?
    {
        let entry_path = entry.path();
        if entry_path
            .extension()
            .is_some_and(|ext| ext == SPOOL_EXTENSION)
        {
            files.push(entry_path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reading::Quality;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::Mutex;

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

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    struct MockSink {
        fail_remaining: AtomicU64,
        accepted: Mutex<Vec<DeviceReading>>,
    }

    impl MockSink {
        fn new(fail_count: u64) -> Self {
            Self {
                fail_remaining: AtomicU64::new(fail_count),
                accepted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StorageSink for MockSink {
        async fn write_batch(&self, readings: &[DeviceReading]) -> Result<u64> {
            if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(CounterSrvError::StorageError("still down".to_string()));
            }
            self.accepted.lock().await.extend_from_slice(readings);
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
    async fn test_store_creates_one_time_ordered_file() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();

        let first = dlq.store(&[reading(1)], "db down").await.unwrap();
        let second = dlq.store(&[reading(2)], "db down").await.unwrap();

        assert_eq!(dlq.pending_count(), 2);
        assert!(first.file_name().unwrap() < second.file_name().unwrap());
        // No tmp leftovers.
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            names.push(entry.unwrap().file_name().into_string().unwrap());
        }
        assert!(names.iter().all(|n| n.ends_with(".json")));
    }

    #[tokio::test]
    async fn test_spool_file_is_self_describing() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();

        let path = dlq
            .store(&[reading(1), reading(2)], "connection refused")
            .await
            .unwrap();
        let record: DeadLetterBatch =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();

        assert_eq!(record.count, 2);
        assert_eq!(record.reason, "connection refused");
        assert_eq!(record.readings.len(), 2);
        assert_eq!(record.readings[0].raw_value, 1);
    }

    #[tokio::test]
    async fn test_replay_deletes_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();
        dlq.store(&[reading(1), reading(2)], "down").await.unwrap();
        dlq.store(&[reading(3)], "down").await.unwrap();

        let sink = MockSink::new(0);
        let outcome = dlq.replay_once(&sink, &policy()).await.unwrap();

        assert_eq!(outcome.replayed_files, 2);
        assert_eq!(outcome.replayed_readings, 3);
        assert!(!outcome.stopped_on_failure);
        assert_eq!(dlq.pending_count(), 0);
        assert_eq!(sink.accepted.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_replay_failure_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();
        dlq.store(&[reading(1)], "down").await.unwrap();

        // Sink fails more times than the policy retries.
        let sink = MockSink::new(100);
        let outcome = dlq.replay_once(&sink, &policy()).await.unwrap();

        assert_eq!(outcome.replayed_files, 0);
        assert!(outcome.stopped_on_failure);
        assert_eq!(dlq.pending_count(), 1);

        // Once the sink recovers the same file replays fine.
        let sink = MockSink::new(0);
        let outcome = dlq.replay_once(&sink, &policy()).await.unwrap();
        assert_eq!(outcome.replayed_files, 1);
        assert_eq!(dlq.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();
        dlq.store(&[reading(1)], "down").await.unwrap();

        std::fs::write(dir.path().join("batch-00000000-garbage.json"), b"not json").unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();
        assert_eq!(dlq.pending_count(), 2);

        let sink = MockSink::new(0);
        let outcome = dlq.replay_once(&sink, &policy()).await.unwrap();

        // The good file replays, the corrupt one is set aside.
        assert_eq!(outcome.replayed_files, 1);
        assert_eq!(dlq.pending_count(), 0);
        assert!(dir.path().join("batch-00000000-garbage.corrupt").exists());
    }

    #[tokio::test]
    async fn test_open_counts_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();
            dlq.store(&[reading(1)], "down").await.unwrap();
        }
        let reopened = DeadLetterQueue::open(dir.path()).await.unwrap();
        assert_eq!(reopened.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_replay_task_drains_spool() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).await.unwrap();
        dlq.store(&[reading(1)], "down").await.unwrap();

        let sink: Arc<dyn StorageSink> = Arc::new(MockSink::new(0));
        let cancel = CancellationToken::new();
        let task = dlq.clone().spawn_replay_task(
            sink,
            policy(),
            Duration::from_secs(1),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while dlq.pending_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        let _ = task.await;
    }
}
