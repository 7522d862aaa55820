//! Shared domain types for the Aura tracking agent.
//! Keep this crate free of SQL/network deps so the agent binary and any
//! sibling tooling can reuse the wire model and the pure geofence logic.

pub mod geo;
pub mod geofence;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic carrying one JSON `TelemetryRecord` per sample tick.
pub fn telemetry_topic(device_id: &str) -> String {
    format!("aura/tracking/{device_id}/telemetry")
}

/// Topic carrying discrete agent events (login, impact).
pub fn events_topic(device_id: &str) -> String {
    format!("aura/tracking/{device_id}/events")
}

/// Topic carrying geofence enter/exit events.
pub fn geofence_topic(device_id: &str) -> String {
    format!("aura/tracking/{device_id}/geofence")
}

/// Which path delivered a record to the broker.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionMode {
    Online,
    OfflineFlush,
}

/// Freshness class of an accepted GPS fix. Downstream analytics annotate on
/// this field, so the three bands are part of the payload contract.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum TemporalQuality {
    Normal,
    StaleFallback,
    StaleCadence,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct GpsSample {
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub speed: f64,
    pub bearing: f64,
    pub accuracy: f64,
    /// Time between the satellite observation and delivery to the agent.
    pub age_ms: i64,
    pub interval_since_last_fix_ms: i64,
    pub temporal_quality: TemporalQuality,
}

/// One sensor axis triple with its precomputed magnitude.
#[derive(Clone, Copy, Serialize, Deserialize, Debug)]
pub struct AxisTriple {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
}

impl AxisTriple {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            magnitude: (x * x + y * y + z * z).sqrt(),
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

/// Inertial snapshot. Accel/gyro are required by the source contract; the
/// remaining channels depend on the hardware and serialize as null when
/// absent.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ImuSample {
    pub accel: AxisTriple,
    pub gyro: AxisTriple,
    pub mag: Option<AxisTriple>,
    pub linear_accel: Option<AxisTriple>,
    pub gravity: Option<AxisTriple>,
    pub rotation: Option<Quaternion>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug)]
pub struct OrientationSample {
    pub azimuth: f64,
    pub pitch: f64,
    pub roll: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct BatteryStatus {
    pub level_pct: f64,
    pub status: String,
    pub temperature_c: f64,
    pub voltage_mv: i64,
    pub health: String,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct WifiInfo {
    pub rssi_dbm: i64,
    pub bssid: String,
    pub frequency_mhz: i64,
    pub channel: i64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct CellularInfo {
    pub network_type: String,
    pub signal_dbm: i64,
    pub signal_level: i64,
    pub cell_id: Option<i64>,
    pub lac: Option<i64>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ConnectivityInfo {
    pub wifi: Option<WifiInfo>,
    pub cellular: Option<CellularInfo>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SystemStatus {
    pub battery: BatteryStatus,
    pub connectivity: ConnectivityInfo,
}

/// Zone annotation carried by records sampled inside a confirmed zone.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct GeofenceContext {
    pub zone_id: Uuid,
    pub zone_name: String,
    pub zone_type: ZoneKind,
}

/// The unit of transport. `message_id` is assigned once at creation and the
/// server deduplicates on it, so it is never rewritten. Absent sensors
/// serialize as null; `geofence_context` is omitted entirely outside zones.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct TelemetryRecord {
    pub message_id: Uuid,
    pub timestamp_ms: i64,
    pub device_id: String,
    pub operator_id: String,
    pub gps: Option<GpsSample>,
    pub imu: Option<ImuSample>,
    pub orientation: Option<OrientationSample>,
    pub system: Option<SystemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_context: Option<GeofenceContext>,
    pub transmission_mode: TransmissionMode,
}

/// Zone categories in priority order for current-zone reporting: the
/// smallest variant wins when several zones contain the fix. The ordering is
/// part of the payload contract; do not reorder without versioning.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    LoadingZone,
    UnloadingZone,
    Deposit,
    Maintenance,
    FuelStation,
    Parking,
    Other,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::LoadingZone => "loading_zone",
            ZoneKind::UnloadingZone => "unloading_zone",
            ZoneKind::Deposit => "deposit",
            ZoneKind::Maintenance => "maintenance",
            ZoneKind::FuelStation => "fuel_station",
            ZoneKind::Parking => "parking",
            ZoneKind::Other => "other",
        }
    }

    /// Unknown categories map to `Other` so a newer server vocabulary does
    /// not break older agents.
    pub fn parse(s: &str) -> Self {
        match s {
            "loading_zone" => ZoneKind::LoadingZone,
            "unloading_zone" => ZoneKind::UnloadingZone,
            "deposit" => ZoneKind::Deposit,
            "maintenance" => ZoneKind::Maintenance,
            "fuel_station" => ZoneKind::FuelStation,
            "parking" => ZoneKind::Parking,
            _ => ZoneKind::Other,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Serialize, Deserialize, Debug)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

/// A zone is either a circle or a closed polygon (implicitly closed, at
/// least three vertices).
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub enum ZoneGeometry {
    Circle { center: LatLon, radius_m: f64 },
    Polygon { vertices: Vec<LatLon> },
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
    pub kind: ZoneKind,
    pub geometry: ZoneGeometry,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceEventType {
    Enter,
    Exit,
    /// Reserved in the payload vocabulary; the state machine emits only
    /// enter and exit.
    Dwell,
}

impl GeofenceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeofenceEventType::Enter => "enter",
            GeofenceEventType::Exit => "exit",
            GeofenceEventType::Dwell => "dwell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enter" => Some(GeofenceEventType::Enter),
            "exit" => Some(GeofenceEventType::Exit),
            "dwell" => Some(GeofenceEventType::Dwell),
            _ => None,
        }
    }
}

/// Discrete zone transition. Same delivery guarantees as telemetry but on
/// its own topic; the storage layer adds the sent flag and retry counter.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct GeofenceEvent {
    pub event_id: Uuid,
    pub zone_id: Uuid,
    pub zone_name: String,
    pub zone_type: ZoneKind,
    pub event_type: GeofenceEventType,
    pub timestamp_ms: i64,
    pub duration_s: Option<f64>,
    pub gps: GpsSample,
}

/// Discrete agent event for the events topic.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Login {
        operator_id: String,
        timestamp_ms: i64,
    },
    Impact {
        magnitude_ms2: f64,
        timestamp_ms: i64,
    },
}

/// Operator roster entry downloaded from the configuration service.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Operator {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_gps() -> GpsSample {
        GpsSample {
            lat: -19.92,
            lon: -43.94,
            altitude: 850.0,
            speed: 4.2,
            bearing: 132.0,
            accuracy: 3.5,
            age_ms: 700,
            interval_since_last_fix_ms: 1000,
            temporal_quality: TemporalQuality::Normal,
        }
    }

    #[test]
    fn record_envelope_serializes_absent_sensors_as_null() {
        let record = TelemetryRecord {
            message_id: Uuid::new_v4(),
            timestamp_ms: 1_700_000_000_000,
            device_id: "truck-07".into(),
            operator_id: "op-11".into(),
            gps: Some(sample_gps()),
            imu: None,
            orientation: None,
            system: None,
            geofence_context: None,
            transmission_mode: TransmissionMode::Online,
        };
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert!(json["imu"].is_null());
        assert!(json["orientation"].is_null());
        // The zone context is omitted, not null, when the device is outside.
        assert!(json.get("geofence_context").is_none());
        assert_eq!(json["transmission_mode"], "online");
        assert_eq!(json["gps"]["temporal_quality"], "normal");
    }

    #[test]
    fn unknown_envelope_fields_are_tolerated() {
        let mut json = serde_json::to_value(TelemetryRecord {
            message_id: Uuid::new_v4(),
            timestamp_ms: 1,
            device_id: "d".into(),
            operator_id: "o".into(),
            gps: None,
            imu: None,
            orientation: None,
            system: None,
            geofence_context: None,
            transmission_mode: TransmissionMode::OfflineFlush,
        })
        .unwrap();
        json["added_in_v9"] = serde_json::json!({"future": true});
        let back: TelemetryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.transmission_mode, TransmissionMode::OfflineFlush);
    }

    #[test]
    fn zone_kind_priority_follows_declaration_order() {
        assert!(ZoneKind::LoadingZone < ZoneKind::UnloadingZone);
        assert!(ZoneKind::UnloadingZone < ZoneKind::Deposit);
        assert!(ZoneKind::FuelStation < ZoneKind::Parking);
        assert!(ZoneKind::Parking < ZoneKind::Other);
    }

    #[test]
    fn zone_kind_round_trips_and_tolerates_unknowns() {
        for kind in [
            ZoneKind::LoadingZone,
            ZoneKind::UnloadingZone,
            ZoneKind::Deposit,
            ZoneKind::Maintenance,
            ZoneKind::FuelStation,
            ZoneKind::Parking,
            ZoneKind::Other,
        ] {
            assert_eq!(ZoneKind::parse(kind.as_str()), kind);
        }
        assert_eq!(ZoneKind::parse("helipad"), ZoneKind::Other);
    }
}
