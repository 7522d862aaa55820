//! Geofence event persistence. Events share the telemetry delivery
//! guarantees but live in their own table and drain to their own topic; the
//! sent flag plus retry counter drive replay.

use anyhow::{Context, Result};
use sqlx::Row;
use tracker_core::{GeofenceEvent, GeofenceEventType, ZoneKind};
use uuid::Uuid;

use super::Store;

#[derive(Clone, Debug)]
pub struct StoredGeofenceEvent {
    pub event: GeofenceEvent,
    pub retry_count: i64,
}

impl Store {
    pub async fn insert_geofence_event(&self, event: &GeofenceEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO geofence_events
                (event_id, zone_id, zone_name, zone_type, event_type,
                 timestamp_ms, duration_s, gps_json, sent, retry_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0)
        "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.zone_id.to_string())
        .bind(&event.zone_name)
        .bind(event.zone_type.as_str())
        .bind(event.event_type.as_str())
        .bind(event.timestamp_ms)
        .bind(event.duration_s)
        .bind(serde_json::to_string(&event.gps).context("encoding event gps")?)
        .execute(&self.pool)
        .await
        .context("inserting geofence event")?;
        Ok(())
    }

    /// Oldest unsent events first. Rows that no longer parse are skipped
    /// with a warning rather than wedging the drain.
    pub async fn unsent_geofence_events(&self, limit: i64) -> Result<Vec<StoredGeofenceEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, zone_id, zone_name, zone_type, event_type,
                   timestamp_ms, duration_s, gps_json, retry_count
            FROM geofence_events
            WHERE sent = 0
            ORDER BY timestamp_ms ASC
            LIMIT ?1
        "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("fetching unsent geofence events")?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_event_id: String = row.get("event_id");
            match stored_event_from_row(&row) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!("skipping undecodable geofence event {raw_event_id}: {err}");
                }
            }
        }
        Ok(events)
    }

    pub async fn mark_event_sent(&self, event_id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE geofence_events SET sent = 1 WHERE event_id = ?1"#)
            .bind(event_id.to_string())
            .execute(&self.pool)
            .await
            .context("marking geofence event sent")?;
        Ok(())
    }

    pub async fn increment_event_retry(&self, event_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE geofence_events SET retry_count = retry_count + 1
            WHERE event_id = ?1
            RETURNING retry_count
        "#,
        )
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("incrementing event retry count")?;
        Ok(row.map(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    pub async fn discard_event(&self, event_id: Uuid) -> Result<()> {
        sqlx::query(r#"DELETE FROM geofence_events WHERE event_id = ?1"#)
            .bind(event_id.to_string())
            .execute(&self.pool)
            .await
            .context("discarding geofence event")?;
        Ok(())
    }

    /// Sent events are kept for a while for local inspection, then reaped.
    pub async fn purge_sent_events(&self, cutoff_ms: i64) -> Result<u64> {
        let result =
            sqlx::query(r#"DELETE FROM geofence_events WHERE sent = 1 AND timestamp_ms < ?1"#)
                .bind(cutoff_ms)
                .execute(&self.pool)
                .await
                .context("purging sent geofence events")?;
        Ok(result.rows_affected())
    }
}

fn stored_event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredGeofenceEvent> {
    let event_id = Uuid::parse_str(row.get("event_id")).context("parsing event id")?;
    let zone_id = Uuid::parse_str(row.get("zone_id")).context("parsing zone id")?;
    let event_type = GeofenceEventType::parse(row.get("event_type"))
        .ok_or_else(|| anyhow::anyhow!("unknown event type"))?;
    let gps = serde_json::from_str(row.get("gps_json")).context("parsing event gps")?;
    Ok(StoredGeofenceEvent {
        event: GeofenceEvent {
            event_id,
            zone_id,
            zone_name: row.get("zone_name"),
            zone_type: ZoneKind::parse(row.get("zone_type")),
            event_type,
            timestamp_ms: row.get("timestamp_ms"),
            duration_s: row.get("duration_s"),
            gps,
        },
        retry_count: row.get("retry_count"),
    })
}
