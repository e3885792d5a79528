//! Storage plane: sink abstraction, TimescaleDB implementation, batch
//! writer and dead-letter queue.
//!
//! The sink is a trait so tests can substitute an in-memory implementation
//! with failure injection; the batch writer and the DLQ replay task share
//! one retry policy.

pub mod batch_writer;
pub mod dlq;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, QueryBuilder};
use tracing::{debug, info, warn};

pub use batch_writer::{BatchWriter, BatchWriterConfig, BatchWriterStats};
pub use dlq::{DeadLetterQueue, ReplayOutcome};

use crate::core::config::TimescaleSettings;
use crate::core::reading::DeviceReading;
use crate::utils::{CounterSrvError, Result};

/// Destination for batched readings.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Insert a batch; primary-key conflicts are skipped, not errors.
    /// Returns the number of rows actually inserted.
    async fn write_batch(&self, readings: &[DeviceReading]) -> Result<u64>;

    /// Cheap reachability probe for the detailed health endpoint.
    async fn test_connection(&self) -> Result<()>;

    fn name(&self) -> &str;
}

/// Exponential backoff shared by the batch writer and DLQ replay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &TimescaleSettings) -> Self {
        Self {
            max_attempts: settings.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(settings.retry_base_delay_ms.max(1)),
            max_delay: Duration::from_millis(settings.max_retry_delay_ms.max(1)),
        }
    }

    /// Delay before attempt `k + 1`: `min(base * 2^(k-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(factor as u32)
            .min(self.max_delay)
    }
}

/// Run one batch through the sink with the retry policy applied.
pub(crate) async fn write_with_retry(
    sink: &dyn StorageSink,
    readings: &[DeviceReading],
    policy: &RetryPolicy,
) -> Result<u64> {
    let mut last_error = CounterSrvError::StorageError("no attempt made".to_string());

    for attempt in 1..=policy.max_attempts {
        match sink.write_batch(readings).await {
            Ok(inserted) => return Ok(inserted),
            Err(e) => {
                warn!(
                    sink = sink.name(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "batch write failed"
                );
                last_error = e;
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(last_error)
}

/// TimescaleDB sink over the Postgres wire protocol.
pub struct TimescaleSink {
    pool: PgPool,
    table: String,
}

impl TimescaleSink {
    /// Open the connection pool. Failure here is fatal at startup.
    pub async fn connect(settings: &TimescaleSettings) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .database(&settings.database)
            .username(&settings.username)
            .password(&settings.password)
            .ssl_mode(if settings.ssl_mode {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });

        let pool = PgPoolOptions::new()
            .min_connections(settings.min_connections)
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.init_timeout_secs))
            .connect_with(options)
            .await?;

        info!(
            host = %settings.host,
            database = %settings.database,
            table = %settings.table_name,
            "timescale sink connected"
        );

        Ok(Self {
            pool,
            table: settings.table_name.clone(),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StorageSink for TimescaleSink {
    async fn write_batch(&self, readings: &[DeviceReading]) -> Result<u64> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (timestamp, device_id, channel, raw_value, \
             processed_value, rate, quality, unit) ",
            self.table
        ));
        builder.push_values(readings, |mut row, reading| {
            row.push_bind(reading.timestamp)
                .push_bind(&reading.device_id)
                .push_bind(reading.channel as i32)
                .push_bind(reading.raw_value)
                .push_bind(reading.processed_value)
                .push_bind(reading.rate)
                .push_bind(reading.quality.as_str())
                .push_bind(&reading.unit);
        });
        builder.push(" ON CONFLICT (timestamp, device_id, channel) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        let inserted = result.rows_affected();
        if inserted < readings.len() as u64 {
            debug!(
                skipped = readings.len() as u64 - inserted,
                "duplicate primary keys skipped"
            );
        }
        Ok(inserted)
    }

    async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "timescale"
    }
}
