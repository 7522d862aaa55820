//! Durable telemetry queue: append-only FIFO over SQLite with TTL and
//! capacity retention. `entry_id` (the rowid) is the enqueue order; the
//! `created_at_ms` index backs TTL purges and the oldest-age stat.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use tracker_core::TelemetryRecord;

use super::Store;
use crate::config::{
    MAX_QUEUE_ENTRIES, QUEUE_CRITICAL_FRACTION, QUEUE_TTL, QUEUE_WARN_FRACTION,
};

/// Retention bounds for maintenance. Production uses the defaults; tests
/// shrink them so capacity scenarios stay fast.
#[derive(Clone, Copy, Debug)]
pub struct QueueLimits {
    pub max_entries: i64,
    pub ttl_ms: i64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_entries: MAX_QUEUE_ENTRIES,
            ttl_ms: QUEUE_TTL.as_millis() as i64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub entry_id: i64,
    pub created_at_ms: i64,
    pub message_id: String,
    pub retry_count: i64,
    pub payload: String,
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct QueueStats {
    pub count: i64,
    pub oldest_created_at_ms: Option<i64>,
    pub warning: bool,
    pub critical: bool,
}

impl Store {
    /// Append one record. The insert has committed (WAL) when this returns,
    /// so a crash immediately after cannot lose the entry.
    pub async fn enqueue(&self, record: &TelemetryRecord) -> Result<i64> {
        self.enqueue_at(record, Utc::now().timestamp_millis()).await
    }

    /// Append with an explicit enqueue time. Retention tests and backfill
    /// tooling drive this directly.
    pub async fn enqueue_at(&self, record: &TelemetryRecord, created_at_ms: i64) -> Result<i64> {
        let payload = serde_json::to_string(record).context("serializing record payload")?;
        let result = sqlx::query(
            r#"
            INSERT INTO telemetry_queue (created_at_ms, message_id, retry_count, payload)
            VALUES (?1, ?2, 0, ?3)
        "#,
        )
        .bind(created_at_ms)
        .bind(record.message_id.to_string())
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("inserting queue entry")?;
        Ok(result.last_insert_rowid())
    }

    /// Up to `n` oldest entries in FIFO order.
    pub async fn peek_oldest(&self, n: i64) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, created_at_ms, message_id, retry_count, payload
            FROM telemetry_queue
            ORDER BY entry_id ASC
            LIMIT ?1
        "#,
        )
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .context("fetching oldest queue entries")?;
        Ok(rows
            .into_iter()
            .map(|row| QueueEntry {
                entry_id: row.get("entry_id"),
                created_at_ms: row.get("created_at_ms"),
                message_id: row.get("message_id"),
                retry_count: row.get("retry_count"),
                payload: row.get("payload"),
            })
            .collect())
    }

    /// Idempotent removal after the broker acknowledged the ids. Unknown
    /// ids are ignored so a crash between publish and delete is harmless.
    pub async fn delete_by_message_ids(&self, message_ids: &[String]) -> Result<u64> {
        let mut removed = 0;
        for chunk in message_ids.chunks(100) {
            let placeholders = (1..=chunk.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql =
                format!("DELETE FROM telemetry_queue WHERE message_id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            removed += query
                .execute(&self.pool)
                .await
                .context("deleting acknowledged entries")?
                .rows_affected();
        }
        Ok(removed)
    }

    pub async fn increment_retry(&self, entry_id: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE telemetry_queue SET retry_count = retry_count + 1
            WHERE entry_id = ?1
            RETURNING retry_count
        "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .context("incrementing retry count")?;
        Ok(row.map(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    /// Drop an entry that exhausted its retry budget.
    pub async fn discard_entry(&self, entry_id: i64) -> Result<()> {
        sqlx::query(r#"DELETE FROM telemetry_queue WHERE entry_id = ?1"#)
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .context("discarding queue entry")?;
        Ok(())
    }

    /// Remove every entry enqueued before `cutoff_ms`; returns the count.
    pub async fn purge_expired(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM telemetry_queue WHERE created_at_ms < ?1"#)
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .context("purging expired entries")?;
        Ok(result.rows_affected())
    }

    /// Evict oldest-first until `count() <= max_entries`. One anchored
    /// DELETE: find the entry at position `max` ordered newest-first and
    /// drop everything strictly older. The anchor is the rowid pk, so
    /// millisecond ties on the clock cannot leave the count above the
    /// bound. No-op (the subquery yields NULL) when under the limit.
    pub async fn enforce_max_size(&self, max_entries: i64) -> Result<u64> {
        if max_entries <= 0 {
            let result = sqlx::query(r#"DELETE FROM telemetry_queue"#)
                .execute(&self.pool)
                .await
                .context("clearing queue")?;
            return Ok(result.rows_affected());
        }
        let result = sqlx::query(
            r#"
            DELETE FROM telemetry_queue
            WHERE entry_id < (
                SELECT entry_id FROM telemetry_queue
                ORDER BY entry_id DESC
                LIMIT 1 OFFSET ?1
            )
        "#,
        )
        .bind(max_entries - 1)
        .execute(&self.pool)
        .await
        .context("enforcing queue capacity")?;
        Ok(result.rows_affected())
    }

    /// Retention pass: TTL purge first so expired entries free space before
    /// FIFO eviction decides what to sacrifice.
    pub async fn queue_maintenance(&self, limits: &QueueLimits) -> Result<(u64, u64)> {
        let cutoff = Utc::now().timestamp_millis() - limits.ttl_ms;
        let purged = self.purge_expired(cutoff).await?;
        let evicted = self.enforce_max_size(limits.max_entries).await?;
        if purged > 0 || evicted > 0 {
            tracing::info!(purged, evicted, "queue maintenance reclaimed entries");
        }
        Ok((purged, evicted))
    }

    pub async fn queue_count(&self) -> Result<i64> {
        sqlx::query_scalar(r#"SELECT COUNT(*) FROM telemetry_queue"#)
            .fetch_one(&self.pool)
            .await
            .context("counting queue entries")
    }

    pub async fn oldest_timestamp(&self) -> Result<Option<i64>> {
        sqlx::query_scalar(r#"SELECT MIN(created_at_ms) FROM telemetry_queue"#)
            .fetch_one(&self.pool)
            .await
            .context("reading oldest queue timestamp")
    }

    pub async fn queue_stats(&self, limits: &QueueLimits) -> Result<QueueStats> {
        let count = self.queue_count().await?;
        let oldest = self.oldest_timestamp().await?;
        let max = limits.max_entries as f64;
        Ok(QueueStats {
            count,
            oldest_created_at_ms: oldest,
            warning: (count as f64) >= max * QUEUE_WARN_FRACTION,
            critical: (count as f64) >= max * QUEUE_CRITICAL_FRACTION,
        })
    }
}
