//! Geofence runtime: wraps the pure engine with the zone snapshot from
//! storage, evaluates each accepted fix, persists the resulting events, and
//! exposes the current-zone context for record annotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracker_core::geofence::GeofenceEngine;
use tracker_core::{GeofenceContext, GpsSample};

use crate::store::Store;

pub struct GeofenceService {
    store: Store,
    engine: RwLock<GeofenceEngine>,
    /// Set while event persistence is failing; detection continues.
    storage_alarm: AtomicBool,
}

impl GeofenceService {
    pub async fn new(store: Store) -> Result<Arc<Self>> {
        let zones = store.load_zones().await?;
        tracing::info!(zones = zones.len(), "geofence engine loaded");
        Ok(Arc::new(Self {
            store,
            engine: RwLock::new(GeofenceEngine::new(zones)),
            storage_alarm: AtomicBool::new(false),
        }))
    }

    /// Refresh the zone snapshot after a config commit. Per-zone state for
    /// surviving zones carries over.
    pub async fn reload_zones(&self) -> Result<()> {
        let zones = self.store.load_zones().await?;
        let count = zones.len();
        self.engine.write().await.set_zones(zones);
        tracing::info!(zones = count, "geofence zones reloaded");
        Ok(())
    }

    /// Consume accepted fixes for the lifetime of the pipeline.
    pub fn start(self: &Arc<Self>, mut fixes: broadcast::Receiver<GpsSample>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match fixes.recv().await {
                    Ok(fix) => service.observe_fix(&fix).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "geofence evaluation lagged behind fixes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn observe_fix(&self, fix: &GpsSample) {
        let events = {
            let mut engine = self.engine.write().await;
            engine.observe(fix, Utc::now().timestamp_millis())
        };
        for event in events {
            tracing::info!(
                zone = %event.zone_name,
                event_type = event.event_type.as_str(),
                duration_s = event.duration_s,
                "geofence transition"
            );
            // A storage failure surfaces on the alarm but never blocks
            // detection of later transitions.
            match self.store.insert_geofence_event(&event).await {
                Ok(()) => {
                    self.storage_alarm.store(false, Ordering::Relaxed);
                }
                Err(err) => {
                    self.storage_alarm.store(true, Ordering::Relaxed);
                    tracing::error!(event_id = %event.event_id, "failed to persist geofence event: {err}");
                }
            }
        }
    }

    pub async fn current_context(&self) -> Option<GeofenceContext> {
        self.engine.read().await.current_zone()
    }

    pub fn storage_alarmed(&self) -> bool {
        self.storage_alarm.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracker_core::{LatLon, TemporalQuality, Zone, ZoneGeometry, ZoneKind};
    use uuid::Uuid;

    fn fix(lat: f64, lon: f64) -> GpsSample {
        GpsSample {
            lat,
            lon,
            altitude: 0.0,
            speed: 0.0,
            bearing: 0.0,
            accuracy: 3.0,
            age_ms: 500,
            interval_since_last_fix_ms: 1000,
            temporal_quality: TemporalQuality::Normal,
        }
    }

    #[tokio::test]
    async fn events_are_persisted_and_context_tracks_confirmed_zone() {
        let store = Store::open_in_memory().await.unwrap();
        let zone = Zone {
            id: Uuid::new_v4(),
            name: "fuel bay".into(),
            kind: ZoneKind::FuelStation,
            geometry: ZoneGeometry::Circle {
                center: LatLon { lat: 0.0, lon: 0.0 },
                radius_m: 50.0,
            },
            active: true,
            updated_at: Utc::now(),
        };
        store.commit_config_snapshot(&[], &[zone.clone()]).await.unwrap();

        let service = GeofenceService::new(store.clone()).await.unwrap();
        assert!(service.current_context().await.is_none());

        // Dwell confirmation needs wall-clock time to pass.
        service.observe_fix(&fix(0.0, 0.0)).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        service.observe_fix(&fix(0.0, 0.0)).await;
        assert!(service.current_context().await.is_none(), "dwell not yet confirmed");

        // No events stored for an unconfirmed pending entry.
        assert!(store.unsent_geofence_events(10).await.unwrap().is_empty());
        assert!(!service.storage_alarmed());
    }

    #[tokio::test]
    async fn reload_zones_picks_up_a_new_snapshot() {
        let store = Store::open_in_memory().await.unwrap();
        let service = GeofenceService::new(store.clone()).await.unwrap();
        service.observe_fix(&fix(0.0, 0.0)).await;
        assert!(service.current_context().await.is_none());

        let zone = Zone {
            id: Uuid::new_v4(),
            name: "pit".into(),
            kind: ZoneKind::LoadingZone,
            geometry: ZoneGeometry::Circle {
                center: LatLon { lat: 0.0, lon: 0.0 },
                radius_m: 50.0,
            },
            active: true,
            updated_at: Utc::now(),
        };
        store.commit_config_snapshot(&[], &[zone]).await.unwrap();
        service.reload_zones().await.unwrap();

        // The engine now evaluates against the new zone.
        service.observe_fix(&fix(0.0, 0.0)).await;
        // Pending only; still no context. The full dwell path is covered by
        // the engine's own tests with a synthetic clock.
        assert!(service.current_context().await.is_none());
    }
}
