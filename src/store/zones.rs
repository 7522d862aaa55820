//! Zone and operator snapshots downloaded by the sync orchestrator. The
//! commit is all-or-nothing: a validation failure upstream leaves the prior
//! snapshot untouched.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracker_core::{LatLon, Operator, Zone, ZoneGeometry, ZoneKind};
use uuid::Uuid;

use super::Store;

impl Store {
    /// Replace both snapshots in one transaction.
    pub async fn commit_config_snapshot(
        &self,
        operators: &[Operator],
        zones: &[Zone],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting snapshot commit")?;

        sqlx::query(r#"DELETE FROM operators"#)
            .execute(&mut *tx)
            .await
            .context("clearing operators")?;
        for op in operators {
            sqlx::query(
                r#"INSERT INTO operators (id, name, active, updated_at) VALUES (?1, ?2, ?3, ?4)"#,
            )
            .bind(&op.id)
            .bind(&op.name)
            .bind(op.active as i64)
            .bind(op.updated_at)
            .execute(&mut *tx)
            .await
            .context("inserting operator row")?;
        }

        sqlx::query(r#"DELETE FROM zones"#)
            .execute(&mut *tx)
            .await
            .context("clearing zones")?;
        for zone in zones {
            let (polygon_json, center_lat, center_lon, radius_m) = match &zone.geometry {
                ZoneGeometry::Circle { center, radius_m } => {
                    (None, Some(center.lat), Some(center.lon), Some(*radius_m))
                }
                ZoneGeometry::Polygon { vertices } => (
                    Some(serde_json::to_string(vertices).context("encoding polygon")?),
                    None,
                    None,
                    None,
                ),
            };
            sqlx::query(
                r#"
                INSERT INTO zones
                    (id, name, kind, polygon_json, center_lat, center_lon, radius_m, active, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            )
            .bind(zone.id.to_string())
            .bind(&zone.name)
            .bind(zone.kind.as_str())
            .bind(polygon_json)
            .bind(center_lat)
            .bind(center_lon)
            .bind(radius_m)
            .bind(zone.active as i64)
            .bind(zone.updated_at)
            .execute(&mut *tx)
            .await
            .context("inserting zone row")?;
        }

        tx.commit().await.context("committing snapshot")?;
        Ok(())
    }

    /// Load the zone snapshot. Rows with unparseable geometry are excluded
    /// from evaluation and logged; they do not fail the load.
    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, kind, polygon_json, center_lat, center_lon, radius_m, active, updated_at
            FROM zones
        "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading zones")?;

        let mut zones = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_id: String = row.get("id");
            let name: String = row.get("name");
            let id = match Uuid::parse_str(&raw_id) {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!(zone = %name, "skipping zone with bad id {raw_id}: {err}");
                    continue;
                }
            };
            let geometry = match zone_geometry_from_row(&row) {
                Ok(geometry) => geometry,
                Err(err) => {
                    tracing::warn!(zone = %name, "excluding zone with bad geometry: {err}");
                    continue;
                }
            };
            zones.push(Zone {
                id,
                name,
                kind: ZoneKind::parse(row.get("kind")),
                geometry,
                active: row.get::<i64, _>("active") != 0,
                updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
            });
        }
        Ok(zones)
    }

    pub async fn load_operators(&self) -> Result<Vec<Operator>> {
        let rows = sqlx::query(r#"SELECT id, name, active, updated_at FROM operators"#)
            .fetch_all(&self.pool)
            .await
            .context("loading operators")?;
        Ok(rows
            .into_iter()
            .map(|row| Operator {
                id: row.get("id"),
                name: row.get("name"),
                active: row.get::<i64, _>("active") != 0,
                updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
            })
            .collect())
    }
}

fn zone_geometry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ZoneGeometry> {
    let radius_m: Option<f64> = row.get("radius_m");
    if let Some(radius_m) = radius_m {
        let center_lat: Option<f64> = row.get("center_lat");
        let center_lon: Option<f64> = row.get("center_lon");
        let (Some(lat), Some(lon)) = (center_lat, center_lon) else {
            anyhow::bail!("circular zone without a center");
        };
        if radius_m <= 0.0 {
            anyhow::bail!("circular zone with radius {radius_m}");
        }
        return Ok(ZoneGeometry::Circle {
            center: LatLon { lat, lon },
            radius_m,
        });
    }

    let polygon_json: Option<String> = row.get("polygon_json");
    let raw = polygon_json.ok_or_else(|| anyhow::anyhow!("zone has neither circle nor polygon"))?;
    let vertices: Vec<LatLon> =
        serde_json::from_str(&raw).context("parsing polygon vertex json")?;
    if vertices.len() < 3 {
        anyhow::bail!("polygon has {} vertices", vertices.len());
    }
    Ok(ZoneGeometry::Polygon { vertices })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle(name: &str) -> Zone {
        Zone {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: ZoneKind::LoadingZone,
            geometry: ZoneGeometry::Circle {
                center: LatLon { lat: -19.9, lon: -43.9 },
                radius_m: 75.0,
            },
            active: true,
            updated_at: Utc::now(),
        }
    }

    fn operator(id: &str) -> Operator {
        Operator {
            id: id.into(),
            name: format!("operator {id}"),
            active: true,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_commit_replaces_previous_state() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .commit_config_snapshot(&[operator("a"), operator("b")], &[circle("old")])
            .await
            .unwrap();
        store
            .commit_config_snapshot(&[operator("c")], &[circle("new-1"), circle("new-2")])
            .await
            .unwrap();

        let operators = store.load_operators().await.unwrap();
        assert_eq!(operators.len(), 1);
        assert_eq!(operators[0].id, "c");

        let zones = store.load_zones().await.unwrap();
        let names: Vec<&str> = zones.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"new-1") && names.contains(&"new-2"));
    }

    #[tokio::test]
    async fn polygon_zone_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let zone = Zone {
            id: Uuid::new_v4(),
            name: "bench".into(),
            kind: ZoneKind::Deposit,
            geometry: ZoneGeometry::Polygon {
                vertices: vec![
                    LatLon { lat: 0.0, lon: 0.0 },
                    LatLon { lat: 0.0, lon: 1.0 },
                    LatLon { lat: 1.0, lon: 0.5 },
                ],
            },
            active: true,
            updated_at: Utc::now(),
        };
        store
            .commit_config_snapshot(&[], std::slice::from_ref(&zone))
            .await
            .unwrap();
        let zones = store.load_zones().await.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].geometry, zone.geometry);
        assert_eq!(zones[0].kind, ZoneKind::Deposit);
    }

    #[tokio::test]
    async fn malformed_polygon_rows_are_excluded_not_fatal() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .commit_config_snapshot(&[], &[circle("good")])
            .await
            .unwrap();
        sqlx::query(
            r#"INSERT INTO zones (id, name, kind, polygon_json, active, updated_at)
               VALUES (?1, 'broken', 'other', '{not json', 1, ?2)"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();

        let zones = store.load_zones().await.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name, "good");
    }
}
