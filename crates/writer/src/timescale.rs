use async_trait::async_trait;
use config::TimescaleWriterConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::QueryBuilder;
use stream::Reading;

use crate::encode::{encode_rows, TimescaleRow};
use crate::{WriteError, WriteTarget};

/// Writes batches as row sets to a TimescaleDB hypertable via a batched
/// `INSERT ... VALUES`. Connection and protocol failures are `Transient`;
/// a rejected row (e.g. a constraint violation on malformed data) is
/// `Permanent`, since retrying the same batch cannot change the outcome.
pub struct TimescaleTarget {
    pool: PgPool,
    table: String,
}

impl TimescaleTarget {
    /// Builds a target from its configuration, eagerly establishing a
    /// connection pool rather than lazily on first write.
    pub async fn new(config: TimescaleWriterConfig) -> Result<Self, WriteError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&config.dsn)
            .await
            .map_err(|err| WriteError::Transient {
                message: format!("failed to connect to timescaledb: {err}"),
            })?;

        Ok(Self { pool, table: config.table })
    }
}

#[async_trait]
impl WriteTarget for TimescaleTarget {
    async fn write_batch(&self, readings: &[Reading]) -> Result<(), WriteError> {
        if readings.is_empty() {
            return Ok(());
        }
        self.insert_rows(&encode_rows(readings)).await
    }

    async fn probe_health(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Dead-letters as JSON-encoded rows rather than the readings
    /// themselves, so re-drain can resend the exact row shape a failed
    /// `INSERT` was attempted with.
    fn encode_for_dlq(&self, readings: &[Reading]) -> Vec<u8> {
        serde_json::to_vec(&encode_rows(readings)).unwrap_or_default()
    }

    async fn replay_raw(&self, payload: &[u8]) -> Result<(), WriteError> {
        let rows: Vec<TimescaleRow> = serde_json::from_slice(payload).map_err(|err| WriteError::Permanent {
            message: format!("dead-lettered timescaledb payload is not valid JSON: {err}"),
        })?;
        if rows.is_empty() {
            return Ok(());
        }
        self.insert_rows(&rows).await
    }

    fn name(&self) -> &'static str {
        "timescaledb"
    }
}

impl TimescaleTarget {
    async fn insert_rows(&self, rows: &[TimescaleRow]) -> Result<(), WriteError> {
        let mut builder = QueryBuilder::new(format!(
            "INSERT INTO {} (time, device_id, channel, raw_value, processed_value, rate, quality, tags_jsonb) ",
            self.table
        ));

        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.time)
                .push_bind(&row.device_id)
                .push_bind(row.channel)
                .push_bind(row.raw_value)
                .push_bind(row.processed_value)
                .push_bind(row.rate)
                .push_bind(&row.quality)
                .push_bind(&row.tags_jsonb);
        });

        let _ = builder.build().execute(&self.pool).await.map_err(classify)?;
        Ok(())
    }
}

fn classify(err: sqlx::Error) -> WriteError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_check_violation() || db_err.is_unique_violation() => {
            WriteError::Permanent {
                message: format!("timescaledb rejected batch: {err}"),
            }
        }
        sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => WriteError::Permanent {
            message: format!("timescaledb rejected batch: {err}"),
        },
        _ => WriteError::Transient {
            message: format!("timescaledb write failed: {err}"),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_error_is_retryable() {
        let err = classify(sqlx::Error::PoolClosed);
        assert!(err.is_retryable());
    }
}
