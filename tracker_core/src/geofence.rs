//! Pure geofence state machine: containment with hysteresis, dwell
//! confirmation, and exit tracking. Evaluated once per accepted GPS fix; the
//! agent feeds it fixes and a millisecond clock so it stays fully testable.

use std::collections::HashMap;

use uuid::Uuid;

use crate::geo::{haversine_m, point_in_polygon};
use crate::{
    GeofenceContext, GeofenceEvent, GeofenceEventType, GpsSample, LatLon, Zone, ZoneGeometry,
};

/// Distance margin added to circular boundaries so a fix jittering on the
/// edge does not flap enter/exit.
pub const HYSTERESIS_M: f64 = 10.0;

/// Continuous time inside a zone before an enter event is confirmed.
pub const DWELL_CONFIRM_MS: i64 = 5_000;

#[derive(Clone, Default, Debug)]
struct ZoneState {
    confirmed_inside: bool,
    /// Set at confirmation; exit duration is measured from here.
    entry_timestamp_ms: Option<i64>,
    pending_entry_time_ms: Option<i64>,
    entry_location: Option<GpsSample>,
}

pub struct GeofenceEngine {
    zones: Vec<Zone>,
    state: HashMap<Uuid, ZoneState>,
}

impl GeofenceEngine {
    pub fn new(zones: Vec<Zone>) -> Self {
        let mut engine = Self {
            zones: Vec::new(),
            state: HashMap::new(),
        };
        engine.set_zones(zones);
        engine
    }

    /// Replace the zone list after a config sync. State carries over for
    /// zones that survive the update; state for removed zones is dropped.
    pub fn set_zones(&mut self, zones: Vec<Zone>) {
        let mut zones: Vec<Zone> = zones.into_iter().filter(|z| z.active).collect();
        zones.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        self.state.retain(|id, _| zones.iter().any(|z| z.id == *id));
        self.zones = zones;
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Evaluate one fix against every zone, advancing per-zone state and
    /// returning the transitions it produced.
    pub fn observe(&mut self, fix: &GpsSample, now_ms: i64) -> Vec<GeofenceEvent> {
        let mut events = Vec::new();
        for zone in &self.zones {
            let inside = zone_contains(zone, fix.lat, fix.lon);
            let state = self.state.entry(zone.id).or_default();

            if state.confirmed_inside {
                if !inside {
                    // First fix outside after confirmation: exit, clear all.
                    let entered = state.entry_timestamp_ms.unwrap_or(now_ms);
                    events.push(GeofenceEvent {
                        event_id: Uuid::new_v4(),
                        zone_id: zone.id,
                        zone_name: zone.name.clone(),
                        zone_type: zone.kind,
                        event_type: GeofenceEventType::Exit,
                        timestamp_ms: now_ms,
                        duration_s: Some((now_ms - entered) as f64 / 1000.0),
                        gps: fix.clone(),
                    });
                    *state = ZoneState::default();
                }
            } else if let Some(pending_since) = state.pending_entry_time_ms {
                if !inside {
                    // Transient crossing: cancel before confirmation.
                    *state = ZoneState::default();
                } else if now_ms - pending_since >= DWELL_CONFIRM_MS {
                    state.confirmed_inside = true;
                    state.entry_timestamp_ms = Some(now_ms);
                    let at = state.entry_location.clone().unwrap_or_else(|| fix.clone());
                    events.push(GeofenceEvent {
                        event_id: Uuid::new_v4(),
                        zone_id: zone.id,
                        zone_name: zone.name.clone(),
                        zone_type: zone.kind,
                        event_type: GeofenceEventType::Enter,
                        timestamp_ms: now_ms,
                        duration_s: None,
                        gps: at,
                    });
                }
            } else if inside {
                state.pending_entry_time_ms = Some(now_ms);
                state.entry_location = Some(fix.clone());
            }
        }
        events
    }

    /// Current zone for record annotation: the highest-priority confirmed
    /// zone (zones are kept sorted by kind, then name).
    pub fn current_zone(&self) -> Option<GeofenceContext> {
        self.zones
            .iter()
            .find(|z| {
                self.state
                    .get(&z.id)
                    .map(|s| s.confirmed_inside)
                    .unwrap_or(false)
            })
            .map(|z| GeofenceContext {
                zone_id: z.id,
                zone_name: z.name.clone(),
                zone_type: z.kind,
            })
    }
}

fn zone_contains(zone: &Zone, lat: f64, lon: f64) -> bool {
    let point = LatLon { lat, lon };
    match &zone.geometry {
        ZoneGeometry::Circle { center, radius_m } => {
            haversine_m(point, *center) <= radius_m + HYSTERESIS_M
        }
        ZoneGeometry::Polygon { vertices } => point_in_polygon(point, vertices),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TemporalQuality, ZoneKind};
    use chrono::Utc;

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

    fn circle_zone(name: &str, kind: ZoneKind, radius_m: f64) -> Zone {
        Zone {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            geometry: ZoneGeometry::Circle {
                center: LatLon { lat: 0.0, lon: 0.0 },
                radius_m,
            },
            active: true,
            updated_at: Utc::now(),
        }
    }

    /// Roughly one meter of latitude in degrees, good enough at the equator.
    const DEG_PER_M: f64 = 1.0 / 111_195.0;

    #[test]
    fn transient_crossing_emits_no_enter() {
        let mut engine = GeofenceEngine::new(vec![circle_zone("pit", ZoneKind::Other, 50.0)]);
        // Inside for 4 seconds, then out: below the 5 s dwell.
        for t in 0..=4 {
            let events = engine.observe(&fix(0.0, 0.0), t * 1000);
            assert!(events.is_empty(), "unexpected events at t={t}");
        }
        let events = engine.observe(&fix(100.0 * DEG_PER_M, 0.0), 5_500);
        assert!(events.is_empty());
        assert!(engine.current_zone().is_none());
    }

    #[test]
    fn dwell_confirms_then_exit_carries_duration() {
        let mut engine = GeofenceEngine::new(vec![circle_zone("pit", ZoneKind::Other, 50.0)]);
        let mut enter_at = None;
        // Inside from t=0 to t=10 s at 1 Hz.
        for t in 0..=10 {
            for ev in engine.observe(&fix(0.0, 0.0), t * 1000) {
                assert_eq!(ev.event_type, GeofenceEventType::Enter);
                assert!(enter_at.is_none(), "enter emitted twice");
                enter_at = Some(ev.timestamp_ms);
            }
        }
        let enter_at = enter_at.expect("no enter event");
        assert_eq!(enter_at, 5_000);
        assert!(engine.current_zone().is_some());

        // First outside fix just after t=10 s.
        let events = engine.observe(&fix(100.0 * DEG_PER_M, 0.0), 10_100);
        assert_eq!(events.len(), 1);
        let exit = &events[0];
        assert_eq!(exit.event_type, GeofenceEventType::Exit);
        let duration = exit.duration_s.unwrap();
        assert!((duration - 5.1).abs() < 0.2, "duration {duration}");
        assert!(engine.current_zone().is_none());
    }

    #[test]
    fn enter_event_carries_first_inside_fix() {
        let mut engine = GeofenceEngine::new(vec![circle_zone("pit", ZoneKind::Other, 50.0)]);
        engine.observe(&fix(10.0 * DEG_PER_M, 0.0), 0);
        for t in 1..=4 {
            engine.observe(&fix(0.0, 0.0), t * 1000);
        }
        let events = engine.observe(&fix(0.0, 0.0), 5_000);
        assert_eq!(events.len(), 1);
        // The snapshot is the fix that opened the pending window.
        assert!((events[0].gps.lat - 10.0 * DEG_PER_M).abs() < 1e-12);
    }

    #[test]
    fn hysteresis_keeps_edge_fixes_inside() {
        let mut engine = GeofenceEngine::new(vec![circle_zone("pit", ZoneKind::Other, 50.0)]);
        // 55 m from center: outside the radius, inside radius + 10 m.
        for t in 0..=5 {
            engine.observe(&fix(55.0 * DEG_PER_M, 0.0), t * 1000);
        }
        assert!(engine.current_zone().is_some());
        // 65 m is beyond the margin.
        let events = engine.observe(&fix(65.0 * DEG_PER_M, 0.0), 6_000);
        assert_eq!(events[0].event_type, GeofenceEventType::Exit);
    }

    #[test]
    fn overlapping_zones_report_highest_priority() {
        let loading = circle_zone("ramp-a", ZoneKind::LoadingZone, 100.0);
        let parking = circle_zone("yard", ZoneKind::Parking, 100.0);
        let mut engine = GeofenceEngine::new(vec![parking, loading]);
        for t in 0..=5 {
            engine.observe(&fix(0.0, 0.0), t * 1000);
        }
        let ctx = engine.current_zone().expect("inside both zones");
        assert_eq!(ctx.zone_type, ZoneKind::LoadingZone);
        assert_eq!(ctx.zone_name, "ramp-a");
    }

    #[test]
    fn polygon_zone_confirms_like_a_circle() {
        let half = 100.0 * DEG_PER_M;
        let zone = Zone {
            id: Uuid::new_v4(),
            name: "bench".into(),
            kind: ZoneKind::Deposit,
            geometry: ZoneGeometry::Polygon {
                vertices: vec![
                    LatLon { lat: -half, lon: -half },
                    LatLon { lat: -half, lon: half },
                    LatLon { lat: half, lon: half },
                    LatLon { lat: half, lon: -half },
                ],
            },
            active: true,
            updated_at: Utc::now(),
        };
        let mut engine = GeofenceEngine::new(vec![zone]);
        let mut entered = false;
        for t in 0..=6 {
            for ev in engine.observe(&fix(0.0, 0.0), t * 1000) {
                assert_eq!(ev.event_type, GeofenceEventType::Enter);
                entered = true;
            }
        }
        assert!(entered);
    }

    #[test]
    fn inactive_zones_are_ignored() {
        let mut zone = circle_zone("closed", ZoneKind::LoadingZone, 50.0);
        zone.active = false;
        let mut engine = GeofenceEngine::new(vec![zone]);
        for t in 0..=10 {
            assert!(engine.observe(&fix(0.0, 0.0), t * 1000).is_empty());
        }
        assert!(engine.current_zone().is_none());
    }

    #[test]
    fn zone_update_drops_state_for_removed_zones() {
        let keep = circle_zone("keep", ZoneKind::Other, 50.0);
        let drop_zone = circle_zone("drop", ZoneKind::Other, 50.0);
        let keep_id = keep.id;
        let mut engine = GeofenceEngine::new(vec![keep.clone(), drop_zone]);
        for t in 0..=5 {
            engine.observe(&fix(0.0, 0.0), t * 1000);
        }
        engine.set_zones(vec![keep]);
        let ctx = engine.current_zone().expect("kept zone still confirmed");
        assert_eq!(ctx.zone_id, keep_id);
        // The removed zone never emits a dangling exit.
        let events = engine.observe(&fix(1.0, 1.0), 6_000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].zone_id, keep_id);
    }
}
