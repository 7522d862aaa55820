//! SQLite storage for the agent: the durable telemetry queue, geofence
//! events, zone/operator snapshots, sync bookkeeping, and the config row.
//!
//! One pooled connection serializes all writers; no caller holds a
//! transaction across an await that publishes to the broker. Durability
//! rides on WAL + synchronous=NORMAL; advisory tuning pragmas are applied
//! best-effort on open.

mod events;
mod queue;
mod zones;

pub use events::StoredGeofenceEvent;
pub use queue::{QueueEntry, QueueLimits, QueueStats};

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use uuid::Uuid;

/// Schema version the migration ladder converges on.
const SCHEMA_VERSION: i64 = 2;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the agent database. A failed integrity check
    /// triggers a destructive rebuild: queued telemetry is forfeit and a
    /// single structured error is emitted.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match Self::try_open(&path).await {
            Ok(store) => Ok(store),
            Err(err) if is_corruption(&err) => {
                tracing::error!(
                    db = %path.display(),
                    error = %err,
                    "storage integrity check failed; rebuilding database, queued telemetry forfeit"
                );
                remove_database_files(&path)?;
                Self::try_open(&path).await.context("reopening rebuilt database")
            }
            Err(err) => Err(err),
        }
    }

    async fn try_open(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // One connection: SQLite is single-writer and the agent's rates are
        // low, so a serialized pool keeps per-connection pragmas coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening sqlite database {}", path.display()))?;

        let store = Self { pool };
        store.check_integrity().await?;
        store.apply_tuning().await;
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for unit tests.
    #[cfg(test)]
    pub(crate) async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn check_integrity(&self) -> Result<()> {
        let verdict: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await
            .context("running integrity check")?;
        if verdict != "ok" {
            anyhow::bail!("integrity check reported: {verdict}");
        }
        Ok(())
    }

    /// Advisory tuning for the embedded flash target. Failure to apply any
    /// of these is logged, not fatal.
    async fn apply_tuning(&self) {
        for (pragma, value) in [
            ("cache_size", "-16384"),
            ("temp_store", "MEMORY"),
            ("wal_autocheckpoint", "1000"),
            ("mmap_size", "67108864"),
        ] {
            if let Err(err) = sqlx::query(&format!("PRAGMA {pragma} = {value}"))
                .execute(&self.pool)
                .await
            {
                tracing::warn!("failed to apply pragma {pragma}={value}: {err}");
            }
        }
    }

    // --- migrations ---

    async fn schema_version(&self) -> Result<i64> {
        let row = sqlx::query("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .context("reading user_version")?;
        Ok(row.get::<i64, _>(0))
    }

    async fn set_schema_version(&self, version: i64) -> Result<()> {
        sqlx::query(&format!("PRAGMA user_version = {version}"))
            .execute(&self.pool)
            .await
            .with_context(|| format!("setting user_version = {version}"))?;
        Ok(())
    }

    /// Forward-only migration ladder keyed on `PRAGMA user_version`.
    pub async fn migrate(&self) -> Result<()> {
        let mut version = self.schema_version().await?;
        while version < SCHEMA_VERSION {
            match version {
                0 => self.apply_v1().await.context("applying schema v1")?,
                1 => self.apply_v2().await.context("applying schema v2")?,
                other => anyhow::bail!("database schema version {other} is newer than this agent"),
            }
            version += 1;
            self.set_schema_version(version).await?;
            tracing::info!(version, "applied schema migration");
        }
        Ok(())
    }

    /// Baseline schema. Statements run separately, each with its own
    /// context, so a failure names the table it came from.
    async fn apply_v1(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry_queue (
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at_ms INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await
        .context("creating telemetry_queue table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS geofence_events (
                event_id TEXT PRIMARY KEY,
                zone_id TEXT NOT NULL,
                zone_name TEXT NOT NULL,
                zone_type TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                duration_s REAL,
                gps_json TEXT NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0
            );
        "#,
        )
        .execute(&self.pool)
        .await
        .context("creating geofence_events table")?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS geofence_events_sent_idx ON geofence_events (sent);"#,
        )
        .execute(&self.pool)
        .await
        .context("creating geofence_events sent index")?;
        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS geofence_events_zone_idx ON geofence_events (zone_id);"#,
        )
        .execute(&self.pool)
        .await
        .context("creating geofence_events zone index")?;
        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS geofence_events_ts_idx ON geofence_events (timestamp_ms);"#,
        )
        .execute(&self.pool)
        .await
        .context("creating geofence_events timestamp index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS zones (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                polygon_json TEXT,
                center_lat REAL,
                center_lon REAL,
                radius_m REAL,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await
        .context("creating zones table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operators (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await
        .context("creating operators table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                data_type TEXT PRIMARY KEY,
                last_sync_ms INTEGER,
                status TEXT,
                item_count INTEGER,
                error TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0
            );
        "#,
        )
        .execute(&self.pool)
        .await
        .context("creating sync_state table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                device_id TEXT NOT NULL,
                equipment_name TEXT NOT NULL DEFAULT '',
                operator_id TEXT NOT NULL DEFAULT '',
                mqtt_host TEXT NOT NULL,
                mqtt_port INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await
        .context("creating config table")?;
        Ok(())
    }

    /// v2: per-record message ids on the queue (backfilled from secure
    /// randomness, never derived from existing columns), the enqueue-time
    /// index, and the tracking flag.
    async fn apply_v2(&self) -> Result<()> {
        sqlx::query(r#"ALTER TABLE telemetry_queue ADD COLUMN message_id TEXT;"#)
            .execute(&self.pool)
            .await
            .context("adding telemetry_queue.message_id")?;

        let orphan_ids: Vec<i64> =
            sqlx::query_scalar(r#"SELECT entry_id FROM telemetry_queue WHERE message_id IS NULL"#)
                .fetch_all(&self.pool)
                .await
                .context("listing entries without message_id")?;
        for entry_id in orphan_ids {
            sqlx::query(r#"UPDATE telemetry_queue SET message_id = ?1 WHERE entry_id = ?2"#)
                .bind(Uuid::new_v4().to_string())
                .bind(entry_id)
                .execute(&self.pool)
                .await
                .context("backfilling message_id")?;
        }

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS telemetry_queue_created_at_idx
               ON telemetry_queue (created_at_ms);"#,
        )
        .execute(&self.pool)
        .await
        .context("creating telemetry_queue created_at index")?;
        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS telemetry_queue_message_id_idx
               ON telemetry_queue (message_id);"#,
        )
        .execute(&self.pool)
        .await
        .context("creating telemetry_queue message_id index")?;

        sqlx::query(
            r#"ALTER TABLE config ADD COLUMN tracking_enabled INTEGER NOT NULL DEFAULT 0;"#,
        )
        .execute(&self.pool)
        .await
        .context("adding config.tracking_enabled")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn apply_legacy_schema_for_tests(&self) -> Result<()> {
        self.apply_v1().await?;
        self.set_schema_version(1).await
    }

    // --- config row ---

    /// Insert the config row on first boot; later boots keep the persisted
    /// row (admin actions own it) but refresh broker coordinates from the
    /// file so a redeploy can repoint the agent.
    pub async fn seed_config(&self, cfg: &crate::config::AgentConfig) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO config
                (id, device_id, equipment_name, operator_id, mqtt_host, mqtt_port,
                 tracking_enabled, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        )
        .bind(&cfg.device_id)
        .bind(&cfg.equipment_name)
        .bind(&cfg.operator_id)
        .bind(&cfg.mqtt_host)
        .bind(cfg.mqtt_port as i64)
        .bind(cfg.tracking_enabled as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("seeding config row")?
        .rows_affected();

        if inserted == 0 {
            sqlx::query(
                r#"UPDATE config SET mqtt_host = ?1, mqtt_port = ?2, updated_at = ?3 WHERE id = 1"#,
            )
            .bind(&cfg.mqtt_host)
            .bind(cfg.mqtt_port as i64)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("refreshing broker coordinates")?;
        }
        Ok(())
    }

    pub async fn device_config(&self) -> Result<DeviceConfig> {
        let row = sqlx::query(
            r#"
            SELECT device_id, equipment_name, operator_id, mqtt_host, mqtt_port, tracking_enabled
            FROM config WHERE id = 1
        "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("reading config row")?;
        Ok(DeviceConfig {
            device_id: row.get("device_id"),
            equipment_name: row.get("equipment_name"),
            operator_id: row.get("operator_id"),
            mqtt_host: row.get("mqtt_host"),
            mqtt_port: row.get::<i64, _>("mqtt_port") as u16,
            tracking_enabled: row.get::<i64, _>("tracking_enabled") != 0,
        })
    }

    pub async fn set_tracking_enabled(&self, enabled: bool) -> Result<()> {
        sqlx::query(r#"UPDATE config SET tracking_enabled = ?1, updated_at = ?2 WHERE id = 1"#)
            .bind(enabled as i64)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("updating tracking_enabled")?;
        Ok(())
    }

    pub async fn set_operator(&self, operator_id: &str) -> Result<()> {
        sqlx::query(r#"UPDATE config SET operator_id = ?1, updated_at = ?2 WHERE id = 1"#)
            .bind(operator_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("updating operator_id")?;
        Ok(())
    }

    // --- sync bookkeeping ---

    /// Upsert one sync_state row. Success and skips reset the consecutive
    /// failure count; failures bump it.
    pub async fn record_sync(
        &self,
        data_type: &str,
        status: SyncStatus,
        item_count: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let failed = status == SyncStatus::Failed;
        sqlx::query(
            r#"
            INSERT INTO sync_state (data_type, last_sync_ms, status, item_count, error, consecutive_failures)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (data_type) DO UPDATE SET
                last_sync_ms = excluded.last_sync_ms,
                status = excluded.status,
                item_count = excluded.item_count,
                error = excluded.error,
                consecutive_failures = CASE
                    WHEN excluded.status = 'failed' THEN sync_state.consecutive_failures + 1
                    ELSE 0
                END
        "#,
        )
        .bind(data_type)
        .bind(Utc::now().timestamp_millis())
        .bind(status.as_str())
        .bind(item_count)
        .bind(error)
        .bind(failed as i64)
        .execute(&self.pool)
        .await
        .context("recording sync state")?;
        Ok(())
    }

    pub async fn sync_state(&self, data_type: &str) -> Result<Option<SyncStateRow>> {
        let row = sqlx::query(
            r#"
            SELECT data_type, last_sync_ms, status, item_count, error, consecutive_failures
            FROM sync_state WHERE data_type = ?1
        "#,
        )
        .bind(data_type)
        .fetch_optional(&self.pool)
        .await
        .context("reading sync state")?;
        Ok(row.map(|row| SyncStateRow {
            data_type: row.get("data_type"),
            last_sync_ms: row.get("last_sync_ms"),
            status: row.get("status"),
            item_count: row.get("item_count"),
            error: row.get("error"),
            consecutive_failures: row.get("consecutive_failures"),
        }))
    }
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub device_id: String,
    pub equipment_name: String,
    pub operator_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub tracking_enabled: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncStatus {
    Success,
    Failed,
    Skipped,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncStateRow {
    pub data_type: String,
    pub last_sync_ms: Option<i64>,
    pub status: Option<String>,
    pub item_count: Option<i64>,
    pub error: Option<String>,
    pub consecutive_failures: i64,
}

fn is_corruption(err: &anyhow::Error) -> bool {
    let rendered = format!("{err:#}").to_lowercase();
    rendered.contains("not a database")
        || rendered.contains("integrity check reported")
        || rendered.contains("malformed")
        || rendered.contains("disk image")
}

fn remove_database_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        let candidate = PathBuf::from(candidate);
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("removing {}", candidate.display()));
            }
        }
    }
    Ok(())
}
