//! Sync orchestrator: a periodic composite task that downloads operators and
//! geofences from the configuration service, validates and commits them
//! atomically, then uploads the durable queue. One run at a time; overlaps
//! are skipped, not queued.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tracker_core::{LatLon, Operator, Zone, ZoneGeometry, ZoneKind};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::{CONFIG_FETCH_TIMEOUT, SYNC_ATTEMPTS, SYNC_BACKOFF_BASE, SYNC_INTERVAL};
use crate::delivery::{DeliveryEngine, DrainReport};
use crate::geofence::GeofenceService;
use crate::store::{Store, SyncStatus};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("remote request failed: {0}")]
    Http(String),
    #[error("payload rejected: {0}")]
    Validation(String),
}

/// Operator record as served by the configuration service.
#[derive(Clone, Debug, Deserialize)]
pub struct OperatorDto {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Geofence record as served by the configuration service. Circles carry a
/// center and radius; polygons carry a JSON-encoded vertex list.
#[derive(Clone, Debug, Deserialize)]
pub struct ZoneDto {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type", default)]
    pub zone_type: String,
    pub center_lat: Option<f64>,
    pub center_lon: Option<f64>,
    pub radius_m: Option<f64>,
    pub polygon_json: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Remote configuration store seam; the HTTP client is one implementation,
/// tests script another.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch_operators(&self) -> Result<Vec<OperatorDto>, SyncError>;
    async fn fetch_zones(&self) -> Result<Vec<ZoneDto>, SyncError>;
}

pub struct HttpConfigSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConfigSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CONFIG_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let url = format!("{}/{path}", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|err| {
            if err.is_connect() || err.is_timeout() {
                SyncError::Network(err.to_string())
            } else {
                SyncError::Http(err.to_string())
            }
        })?;
        let response = response
            .error_for_status()
            .map_err(|err| SyncError::Http(err.to_string()))?;
        response
            .json()
            .await
            .map_err(|err| SyncError::Http(format!("decoding {url}: {err}")))
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch_operators(&self) -> Result<Vec<OperatorDto>, SyncError> {
        self.get_json("operators").await
    }

    async fn fetch_zones(&self) -> Result<Vec<ZoneDto>, SyncError> {
        self.get_json("geofences").await
    }
}

/// Guardrails applied before any commit. Returns the parsed domain values
/// so validation and conversion cannot drift apart.
pub fn validate_snapshot(
    operators: &[OperatorDto],
    zones: &[ZoneDto],
) -> Result<(Vec<Operator>, Vec<Zone>), SyncError> {
    if !operators.iter().any(|op| op.active) {
        return Err(SyncError::Validation("no active operators".into()));
    }
    let now = Utc::now();
    let mut parsed_operators = Vec::with_capacity(operators.len());
    for op in operators {
        if op.id.trim().is_empty() {
            return Err(SyncError::Validation("operator with empty id".into()));
        }
        if op.name.trim().is_empty() {
            return Err(SyncError::Validation(format!(
                "operator {} has an empty name",
                op.id
            )));
        }
        parsed_operators.push(Operator {
            id: op.id.clone(),
            name: op.name.clone(),
            active: op.active,
            updated_at: now,
        });
    }

    let mut parsed_zones = Vec::with_capacity(zones.len());
    for zone in zones {
        if zone.name.trim().is_empty() {
            return Err(SyncError::Validation(format!(
                "zone {} has an empty name",
                zone.id
            )));
        }
        let geometry = match (zone.radius_m, &zone.polygon_json) {
            (Some(radius_m), _) => {
                if radius_m <= 0.0 {
                    return Err(SyncError::Validation(format!(
                        "zone {} has radius {radius_m}",
                        zone.name
                    )));
                }
                let (Some(lat), Some(lon)) = (zone.center_lat, zone.center_lon) else {
                    return Err(SyncError::Validation(format!(
                        "circular zone {} is missing its center",
                        zone.name
                    )));
                };
                ZoneGeometry::Circle {
                    center: LatLon { lat, lon },
                    radius_m,
                }
            }
            (None, Some(raw)) => {
                let vertices: Vec<LatLon> = serde_json::from_str(raw).map_err(|err| {
                    SyncError::Validation(format!("zone {} polygon json: {err}", zone.name))
                })?;
                if vertices.len() < 3 {
                    return Err(SyncError::Validation(format!(
                        "zone {} polygon has {} vertices",
                        zone.name,
                        vertices.len()
                    )));
                }
                ZoneGeometry::Polygon { vertices }
            }
            (None, None) => {
                return Err(SyncError::Validation(format!(
                    "zone {} has neither radius nor polygon",
                    zone.name
                )));
            }
        };
        parsed_zones.push(Zone {
            id: zone.id,
            name: zone.name.clone(),
            kind: ZoneKind::parse(&zone.zone_type),
            geometry,
            active: zone.active,
            updated_at: now,
        });
    }
    Ok((parsed_operators, parsed_zones))
}

/// Overall outcome of one orchestrator run.
#[derive(Clone, Debug)]
pub enum SyncResult {
    Success {
        downloaded: usize,
        uploaded: u64,
    },
    Partial {
        download_ok: bool,
        upload_ok: bool,
    },
    NoNetwork,
    Error(String),
}

impl SyncResult {
    /// A partial with both sides failed should be retried by the scheduler.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncResult::NoNetwork
                | SyncResult::Error(_)
                | SyncResult::Partial {
                    download_ok: false,
                    upload_ok: false,
                }
        )
    }
}

pub struct SyncOrchestrator {
    store: Store,
    delivery: Arc<DeliveryEngine>,
    geofence: Arc<GeofenceService>,
    broker: Arc<dyn Broker>,
    source: Arc<dyn ConfigSource>,
    run_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Store,
        delivery: Arc<DeliveryEngine>,
        geofence: Arc<GeofenceService>,
        broker: Arc<dyn Broker>,
        source: Arc<dyn ConfigSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            delivery,
            geofence,
            broker,
            source,
            run_lock: Mutex::new(()),
        })
    }

    /// Periodic schedule plus network-up triggers, until shutdown.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut connection = orchestrator.broker.subscribe_connection();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = connection.changed() => {
                        if changed.is_err() || !*connection.borrow_and_update() {
                            continue;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }
                match orchestrator.run_once().await {
                    None => {}
                    Some(result) => {
                        if result.is_retryable() {
                            tracing::warn!(?result, "sync run unsuccessful");
                        } else {
                            tracing::info!(?result, "sync run finished");
                        }
                    }
                }
            }
        })
    }

    /// One full run under the single-runner lock. Returns `None` when a run
    /// was already active (skipped, not queued).
    pub async fn run_once(&self) -> Option<SyncResult> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            tracing::debug!("sync already running; skipping");
            return None;
        };

        let download = self.download_phase().await;
        let upload = self.upload_phase().await;

        let result = match (&download, &upload) {
            (Ok(downloaded), Ok(report)) => SyncResult::Success {
                downloaded: *downloaded,
                uploaded: report.delivered + report.events_delivered,
            },
            (Err(SyncError::Network(_)), Err(_)) if !self.broker.is_connected() => {
                SyncResult::NoNetwork
            }
            (download, upload) => SyncResult::Partial {
                download_ok: download.is_ok(),
                upload_ok: upload.is_ok(),
            },
        };
        Some(result)
    }

    /// Phase 1: fetch, validate, commit atomically. Prior state is retained
    /// on any failure; SyncState tracks both data classes.
    async fn download_phase(&self) -> Result<usize, SyncError> {
        let outcome = retry_with_backoff("config download", || async {
            let operators = self.source.fetch_operators().await?;
            let zones = self.source.fetch_zones().await?;
            let (operators, zones) = validate_snapshot(&operators, &zones)?;
            self.store
                .commit_config_snapshot(&operators, &zones)
                .await
                .map_err(|err| SyncError::Http(format!("commit failed: {err}")))?;
            Ok((operators.len(), zones.len()))
        })
        .await;

        match outcome {
            Ok((operator_count, zone_count)) => {
                self.record_phase("operators", SyncStatus::Success, operator_count as i64, None)
                    .await;
                self.record_phase("geofences", SyncStatus::Success, zone_count as i64, None)
                    .await;
                if let Err(err) = self.geofence.reload_zones().await {
                    tracing::warn!("zone reload after commit failed: {err}");
                }
                Ok(operator_count + zone_count)
            }
            Err(err) => {
                let message = err.to_string();
                self.record_phase("operators", SyncStatus::Failed, 0, Some(&message))
                    .await;
                self.record_phase("geofences", SyncStatus::Failed, 0, Some(&message))
                    .await;
                Err(err)
            }
        }
    }

    /// Phase 2: drain the queue through the delivery engine.
    async fn upload_phase(&self) -> Result<DrainReport, SyncError> {
        if !self.broker.is_connected() {
            self.record_phase("telemetry_upload", SyncStatus::Skipped, 0, Some("offline"))
                .await;
            self.record_phase("event_upload", SyncStatus::Skipped, 0, Some("offline"))
                .await;
            return Err(SyncError::Network("broker offline".into()));
        }

        let outcome = retry_with_backoff("queue upload", || async {
            let report = self
                .delivery
                .drain()
                .await
                .map_err(|err| SyncError::Http(format!("drain failed: {err}")))?;
            if report.completed {
                Ok(report)
            } else {
                Err(SyncError::Network("drain interrupted by publish failure".into()))
            }
        })
        .await;

        match &outcome {
            Ok(report) => {
                self.record_phase(
                    "telemetry_upload",
                    SyncStatus::Success,
                    report.delivered as i64,
                    None,
                )
                .await;
                self.record_phase(
                    "event_upload",
                    SyncStatus::Success,
                    report.events_delivered as i64,
                    None,
                )
                .await;
            }
            Err(err) => {
                let message = err.to_string();
                self.record_phase("telemetry_upload", SyncStatus::Failed, 0, Some(&message))
                    .await;
                self.record_phase("event_upload", SyncStatus::Failed, 0, Some(&message))
                    .await;
            }
        }
        outcome
    }

    async fn record_phase(
        &self,
        data_type: &str,
        status: SyncStatus,
        item_count: i64,
        error: Option<&str>,
    ) {
        if let Err(err) = self
            .store
            .record_sync(data_type, status, item_count, error)
            .await
        {
            tracing::warn!(data_type, "failed to record sync state: {err}");
        }
    }
}

/// Up to three attempts with exponential backoff (2 s, then 4 s). Validation
/// failures are terminal; retrying the same rejected payload cannot help.
async fn retry_with_backoff<T, F, Fut>(what: &str, mut attempt_fn: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SyncError>>,
{
    let mut delay = SYNC_BACKOFF_BASE;
    let mut last_err = None;
    for attempt in 1..=SYNC_ATTEMPTS {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err @ SyncError::Validation(_)) => return Err(err),
            Err(err) => {
                tracing::warn!(attempt, "{what} attempt failed: {err}");
                last_err = Some(err);
                if attempt < SYNC_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| SyncError::Http(format!("{what} failed"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn operator(id: &str) -> OperatorDto {
        OperatorDto {
            id: id.into(),
            name: format!("operator {id}"),
            active: true,
        }
    }

    fn circle_zone(name: &str) -> ZoneDto {
        ZoneDto {
            id: Uuid::new_v4(),
            name: name.into(),
            zone_type: "loading_zone".into(),
            center_lat: Some(-19.9),
            center_lon: Some(-43.9),
            radius_m: Some(60.0),
            polygon_json: None,
            active: true,
        }
    }

    #[test]
    fn valid_snapshot_parses() {
        let mut polygon = circle_zone("bench");
        polygon.radius_m = None;
        polygon.center_lat = None;
        polygon.center_lon = None;
        polygon.polygon_json =
            Some(r#"[{"lat":0.0,"lon":0.0},{"lat":0.0,"lon":1.0},{"lat":1.0,"lon":0.5}]"#.into());
        polygon.zone_type = "deposit".into();

        let (operators, zones) =
            validate_snapshot(&[operator("a")], &[circle_zone("pit"), polygon]).unwrap();
        assert_eq!(operators.len(), 1);
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].kind, ZoneKind::LoadingZone);
        assert_eq!(zones[1].kind, ZoneKind::Deposit);
    }

    #[test]
    fn snapshot_without_active_operators_is_rejected() {
        let mut inactive = operator("a");
        inactive.active = false;
        let err = validate_snapshot(&[inactive], &[]).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn operator_guardrails_reject_empty_fields() {
        let mut bad_id = operator("");
        bad_id.id = "  ".into();
        assert!(validate_snapshot(&[bad_id, operator("b")], &[]).is_err());

        let mut bad_name = operator("a");
        bad_name.name = "".into();
        assert!(validate_snapshot(&[bad_name], &[]).is_err());
    }

    #[test]
    fn zone_guardrails_reject_bad_geometry() {
        let mut no_radius = circle_zone("pit");
        no_radius.radius_m = Some(0.0);
        assert!(validate_snapshot(&[operator("a")], &[no_radius]).is_err());

        let mut short_polygon = circle_zone("bench");
        short_polygon.radius_m = None;
        short_polygon.polygon_json = Some(r#"[{"lat":0.0,"lon":0.0}]"#.into());
        assert!(validate_snapshot(&[operator("a")], &[short_polygon]).is_err());

        let mut bad_json = circle_zone("bench");
        bad_json.radius_m = None;
        bad_json.polygon_json = Some("{not json".into());
        assert!(validate_snapshot(&[operator("a")], &[bad_json]).is_err());

        let mut nothing = circle_zone("ghost");
        nothing.radius_m = None;
        assert!(validate_snapshot(&[operator("a")], &[nothing]).is_err());
    }

    #[test]
    fn unknown_zone_type_maps_to_other() {
        let mut dto = circle_zone("pad");
        dto.zone_type = "helipad".into();
        let (_, zones) = validate_snapshot(&[operator("a")], &[dto]).unwrap();
        assert_eq!(zones[0].kind, ZoneKind::Other);
    }

    #[tokio::test]
    async fn retry_stops_early_on_validation_errors() {
        let mut calls = 0;
        let result: Result<(), SyncError> = retry_with_backoff("test", || {
            calls += 1;
            async { Err(SyncError::Validation("nope".into())) }
        })
        .await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_attempts_thrice_with_growing_backoff() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_in = std::sync::Arc::clone(&calls);
        let started = tokio::time::Instant::now();
        let result: Result<(), SyncError> = retry_with_backoff("test", move || {
            let calls = std::sync::Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(SyncError::Network("down".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(SyncError::Network(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        // 2 s + 4 s of backoff elapsed on the paused clock.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }
}
