//! Sensor sources. Hardware is an opaque collaborator delivering raw
//! samples on bounded channels; each source keeps the most recent processed
//! sample for the aggregator's `latest()` snapshot.
//!
//! The location source owns the GPS stale filter: every raw fix is accepted
//! into one of the three temporal-quality bands or discarded, and a
//! starvation watchdog re-registers the listener when no fix has been
//! accepted for too long.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracker_core::{
    AgentEvent, AxisTriple, GpsSample, ImuSample, OrientationSample, Quaternion, SystemStatus,
    TemporalQuality,
};

/// Fixes younger than this are plainly fresh.
const FRESH_AGE: Duration = Duration::from_secs(4);
/// Average inter-callback cadence above this marks a slow pipeline.
const SLOW_CADENCE: Duration = Duration::from_secs(2);
/// No accepted fix for this long triggers listener re-registration.
const STARVATION: Duration = Duration::from_secs(30);
/// Starvation checks run on this cadence.
const STARVATION_CHECK: Duration = Duration::from_secs(10);
/// Callback intervals averaged for the cadence estimate.
const CADENCE_WINDOW: usize = 10;

/// Accel magnitude that reports an impact, and the re-arm level below it.
const IMPACT_THRESHOLD_MS2: f64 = 29.4;
const IMPACT_REARM_MS2: f64 = 15.0;

/// One raw fix as delivered by the platform callback.
#[derive(Clone, Debug)]
pub struct RawFix {
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub speed: f64,
    pub bearing: f64,
    pub accuracy: f64,
    /// Wall-clock time of the satellite observation.
    pub fix_time_ms: i64,
    /// How many fixes arrived in the same callback burst.
    pub batch_size: usize,
}

/// One raw inertial sample. Accel and gyro are required by the contract;
/// the remaining channels depend on the hardware.
#[derive(Clone, Debug)]
pub struct RawImu {
    pub accel: (f64, f64, f64),
    pub gyro: (f64, f64, f64),
    pub mag: Option<(f64, f64, f64)>,
    pub linear_accel: Option<(f64, f64, f64)>,
    pub gravity: Option<(f64, f64, f64)>,
    pub rotation: Option<Quaternion>,
    pub orientation: Option<OrientationSample>,
}

/// The platform side of the location contract: the agent can tear down and
/// re-create the listener, and ask for a last-known fix, but never blocks
/// on either.
#[async_trait]
pub trait LocationFeed: Send + Sync {
    async fn reregister(&self);
    async fn request_last_known(&self);
}

#[derive(Default)]
struct LocationInner {
    latest: Option<GpsSample>,
    last_accept_at: Option<Instant>,
    last_callback_at: Option<Instant>,
    recent_intervals: VecDeque<Duration>,
    accepted: u64,
    discarded: u64,
}

impl LocationInner {
    fn cadence_average(&self) -> Option<Duration> {
        if self.recent_intervals.is_empty() {
            return None;
        }
        let total: Duration = self.recent_intervals.iter().sum();
        Some(total / self.recent_intervals.len() as u32)
    }
}

pub struct LocationSource {
    inner: Arc<RwLock<LocationInner>>,
    accepted_tx: broadcast::Sender<GpsSample>,
}

impl Default for LocationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationSource {
    pub fn new() -> Self {
        let (accepted_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(RwLock::new(LocationInner::default())),
            accepted_tx,
        }
    }

    /// Every accepted fix, for consumers that evaluate per fix rather than
    /// per tick (the geofence engine).
    pub fn subscribe_fixes(&self) -> broadcast::Receiver<GpsSample> {
        self.accepted_tx.subscribe()
    }

    /// Begin consuming the raw feed and start the starvation watchdog. The
    /// rate is advisory; the platform may duty-cycle below it.
    pub fn start(&self, _rate_hz: f64, feed_rx: mpsc::Receiver<RawFix>, feed: Arc<dyn LocationFeed>) {
        let inner = Arc::clone(&self.inner);
        let accepted_tx = self.accepted_tx.clone();
        tokio::spawn(async move {
            let mut fixes = ReceiverStream::new(feed_rx);
            while let Some(fix) = fixes.next().await {
                if let Some(sample) = process_fix(&inner, fix).await {
                    let _ = accepted_tx.send(sample);
                }
            }
            tracing::warn!("location feed closed");
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STARVATION_CHECK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let starved = {
                    let inner = inner.read().await;
                    match inner.last_accept_at {
                        Some(at) => at.elapsed() > STARVATION,
                        None => inner.latest.is_none(),
                    }
                };
                if starved {
                    tracing::warn!("gps starvation; re-registering listener");
                    feed.reregister().await;
                    feed.request_last_known().await;
                }
            }
        });
    }

    pub async fn latest(&self) -> Option<GpsSample> {
        self.inner.read().await.latest.clone()
    }

    /// Time since the last accepted fix, for the supervisor's watchdog.
    pub async fn last_accept_age(&self) -> Option<Duration> {
        self.inner.read().await.last_accept_at.map(|at| at.elapsed())
    }

    #[cfg(test)]
    async fn counts(&self) -> (u64, u64) {
        let inner = self.inner.read().await;
        (inner.accepted, inner.discarded)
    }
}

/// Apply the stale filter to one raw fix; returns the accepted sample.
async fn process_fix(inner: &RwLock<LocationInner>, fix: RawFix) -> Option<GpsSample> {
    let now = Instant::now();
    let now_ms = Utc::now().timestamp_millis();
    let age_ms = (now_ms - fix.fix_time_ms).max(0);

    let mut inner = inner.write().await;

    if let Some(previous) = inner.last_callback_at {
        if inner.recent_intervals.len() == CADENCE_WINDOW {
            inner.recent_intervals.pop_front();
        }
        inner.recent_intervals.push_back(now - previous);
    }
    inner.last_callback_at = Some(now);

    let quality = if age_ms <= FRESH_AGE.as_millis() as i64 {
        Some(TemporalQuality::Normal)
    } else if inner
        .cadence_average()
        .map(|avg| avg > SLOW_CADENCE)
        .unwrap_or(false)
    {
        // The pipeline itself is slow; stale fixes are the best we get.
        Some(TemporalQuality::StaleCadence)
    } else {
        let dry_spell = inner
            .last_accept_at
            .map(|at| now - at > STARVATION / 2)
            .unwrap_or(true);
        if dry_spell || fix.batch_size > 1 {
            Some(TemporalQuality::StaleFallback)
        } else {
            None
        }
    };

    let Some(quality) = quality else {
        inner.discarded += 1;
        tracing::debug!(age_ms, "discarding stale fix");
        return None;
    };

    let interval_since_last_fix_ms = inner
        .last_accept_at
        .map(|at| (now - at).as_millis() as i64)
        .unwrap_or(0);
    let sample = GpsSample {
        lat: fix.lat,
        lon: fix.lon,
        altitude: fix.altitude,
        speed: fix.speed,
        bearing: fix.bearing,
        accuracy: fix.accuracy,
        age_ms,
        interval_since_last_fix_ms,
        temporal_quality: quality,
    };
    inner.latest = Some(sample.clone());
    inner.last_accept_at = Some(now);
    inner.accepted += 1;
    Some(sample)
}

#[derive(Default)]
struct ImuInner {
    latest: Option<ImuSample>,
    orientation: Option<OrientationSample>,
    last_sample_at: Option<Instant>,
    impact_armed: bool,
}

pub struct ImuSource {
    inner: Arc<RwLock<ImuInner>>,
}

impl Default for ImuSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ImuSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ImuInner {
                impact_armed: true,
                ..ImuInner::default()
            })),
        }
    }

    /// Consume the raw inertial feed. Impact crossings are edge-reported on
    /// `events_tx`; a full channel drops the event rather than blocking.
    pub fn start(
        &self,
        _rate_hz: f64,
        feed_rx: mpsc::Receiver<RawImu>,
        events_tx: mpsc::Sender<AgentEvent>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut samples = ReceiverStream::new(feed_rx);
            while let Some(raw) = samples.next().await {
                let sample = ImuSample {
                    accel: triple(raw.accel),
                    gyro: triple(raw.gyro),
                    mag: raw.mag.map(triple),
                    linear_accel: raw.linear_accel.map(triple),
                    gravity: raw.gravity.map(triple),
                    rotation: raw.rotation,
                };
                let magnitude = sample.accel.magnitude;

                let mut inner = inner.write().await;
                if raw.orientation.is_some() {
                    inner.orientation = raw.orientation;
                }
                inner.latest = Some(sample);
                inner.last_sample_at = Some(Instant::now());

                // Edge-triggered: one event per excursion above threshold.
                if inner.impact_armed && magnitude >= IMPACT_THRESHOLD_MS2 {
                    inner.impact_armed = false;
                    let _ = events_tx.try_send(AgentEvent::Impact {
                        magnitude_ms2: magnitude,
                        timestamp_ms: Utc::now().timestamp_millis(),
                    });
                } else if !inner.impact_armed && magnitude < IMPACT_REARM_MS2 {
                    inner.impact_armed = true;
                }
            }
            tracing::warn!("imu feed closed");
        });
    }

    pub async fn latest(&self) -> Option<ImuSample> {
        self.inner.read().await.latest.clone()
    }

    pub async fn latest_orientation(&self) -> Option<OrientationSample> {
        self.inner.read().await.orientation
    }

    pub async fn last_sample_age(&self) -> Option<Duration> {
        self.inner.read().await.last_sample_at.map(|at| at.elapsed())
    }
}

fn triple((x, y, z): (f64, f64, f64)) -> AxisTriple {
    AxisTriple::new(x, y, z)
}

pub struct SystemSource {
    latest: Arc<RwLock<Option<SystemStatus>>>,
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSource {
    pub fn new() -> Self {
        Self {
            latest: Arc::new(RwLock::new(None)),
        }
    }

    pub fn start(&self, _rate_hz: f64, feed_rx: mpsc::Receiver<SystemStatus>) {
        let latest = Arc::clone(&self.latest);
        tokio::spawn(async move {
            let mut snapshots = ReceiverStream::new(feed_rx);
            while let Some(status) = snapshots.next().await {
                *latest.write().await = Some(status);
            }
            tracing::warn!("system feed closed");
        });
    }

    pub async fn latest(&self) -> Option<SystemStatus> {
        self.latest.read().await.clone()
    }
}

/// Sender half of the raw feed channels. An embedding process injects
/// platform samples through these; the supervisor keeps them alive for the
/// life of the pipeline, and dropping them ends the source tasks.
pub struct FeedSenders {
    pub fix: mpsc::Sender<RawFix>,
    pub imu: mpsc::Sender<RawImu>,
    pub system: mpsc::Sender<SystemStatus>,
}

/// Receiver half, consumed by the sources on `start`.
pub struct FeedReceivers {
    pub fix: mpsc::Receiver<RawFix>,
    pub imu: mpsc::Receiver<RawImu>,
    pub system: mpsc::Receiver<SystemStatus>,
}

pub fn feed_channels() -> (FeedSenders, FeedReceivers) {
    let (fix_tx, fix_rx) = mpsc::channel(64);
    let (imu_tx, imu_rx) = mpsc::channel(256);
    let (system_tx, system_rx) = mpsc::channel(16);
    (
        FeedSenders {
            fix: fix_tx,
            imu: imu_tx,
            system: system_tx,
        },
        FeedReceivers {
            fix: fix_rx,
            imu: imu_rx,
            system: system_rx,
        },
    )
}

/// Hardware stand-in for bench runs: a slow random walk for GPS, gravity
/// plus noise for the IMU, and a slowly draining battery. Carries the same
/// contract as a platform feed, including last-known-fix requests.
pub struct SimulatedFeed {
    fix_tx: mpsc::Sender<RawFix>,
    position: std::sync::Mutex<(f64, f64)>,
}

impl SimulatedFeed {
    /// Spawn the producer tasks onto the given feed senders.
    pub fn start(
        feeds: &FeedSenders,
        origin: (f64, f64),
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Arc<Self> {
        let feed = Arc::new(Self {
            fix_tx: feeds.fix.clone(),
            position: std::sync::Mutex::new(origin),
        });

        let gps = Arc::clone(&feed);
        let fix_tx = feeds.fix.clone();
        let mut gps_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = gps_shutdown.changed() => if *gps_shutdown.borrow() { return },
                }
                let fix = gps.next_fix();
                if fix_tx.send(fix).await.is_err() {
                    return;
                }
            }
        });

        let imu_tx = feeds.imu.clone();
        let mut imu_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(200));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = imu_shutdown.changed() => if *imu_shutdown.borrow() { return },
                }
                let raw = {
                    let mut rng = rand::thread_rng();
                    use rand::Rng;
                    RawImu {
                        accel: (
                            rng.gen_range(-0.3..0.3),
                            rng.gen_range(-0.3..0.3),
                            9.81 + rng.gen_range(-0.2..0.2),
                        ),
                        gyro: (
                            rng.gen_range(-0.05..0.05),
                            rng.gen_range(-0.05..0.05),
                            rng.gen_range(-0.05..0.05),
                        ),
                        mag: None,
                        linear_accel: None,
                        gravity: Some((0.0, 0.0, 9.81)),
                        rotation: None,
                        orientation: Some(OrientationSample {
                            azimuth: rng.gen_range(0.0..360.0),
                            pitch: rng.gen_range(-3.0..3.0),
                            roll: rng.gen_range(-3.0..3.0),
                        }),
                    }
                };
                if imu_tx.send(raw).await.is_err() {
                    return;
                }
            }
        });

        let system_tx = feeds.system.clone();
        tokio::spawn(async move {
            let mut battery = 97.0f64;
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                }
                battery = (battery - 0.05).max(5.0);
                let status = SystemStatus {
                    battery: tracker_core::BatteryStatus {
                        level_pct: battery,
                        status: "discharging".into(),
                        temperature_c: 31.0,
                        voltage_mv: 3_900,
                        health: "good".into(),
                    },
                    connectivity: tracker_core::ConnectivityInfo {
                        wifi: None,
                        cellular: Some(tracker_core::CellularInfo {
                            network_type: "lte".into(),
                            signal_dbm: -92,
                            signal_level: 3,
                            cell_id: Some(7_431_002),
                            lac: Some(310),
                        }),
                    },
                };
                if system_tx.send(status).await.is_err() {
                    return;
                }
            }
        });

        feed
    }

    fn next_fix(&self) -> RawFix {
        let mut rng = rand::thread_rng();
        use rand::Rng;
        let mut position = self.position.lock().expect("position lock");
        position.0 += rng.gen_range(-0.00002..0.00002);
        position.1 += rng.gen_range(-0.00002..0.00002);
        RawFix {
            lat: position.0,
            lon: position.1,
            altitude: 840.0 + rng.gen_range(-2.0..2.0),
            speed: rng.gen_range(0.0..8.0),
            bearing: rng.gen_range(0.0..360.0),
            accuracy: rng.gen_range(2.0..8.0),
            fix_time_ms: Utc::now().timestamp_millis() - rng.gen_range(100..900),
            batch_size: 1,
        }
    }
}

#[async_trait]
impl LocationFeed for SimulatedFeed {
    async fn reregister(&self) {
        tracing::info!("simulated feed re-registered");
    }

    async fn request_last_known(&self) {
        let fix = {
            let position = self.position.lock().expect("position lock");
            RawFix {
                lat: position.0,
                lon: position.1,
                altitude: 840.0,
                speed: 0.0,
                bearing: 0.0,
                accuracy: 20.0,
                // Last-known fixes are stale by definition.
                fix_time_ms: Utc::now().timestamp_millis() - 20_000,
                batch_size: 1,
            }
        };
        let _ = self.fix_tx.send(fix).await;
    }
}

/// A platform feed placeholder for builds without hardware bindings: keeps
/// the contract but never produces and ignores recovery requests.
pub struct IdleFeed;

#[async_trait]
impl LocationFeed for IdleFeed {
    async fn reregister(&self) {}

    async fn request_last_known(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(fix_time_ms: i64, batch_size: usize) -> RawFix {
        RawFix {
            lat: -19.9,
            lon: -43.9,
            altitude: 850.0,
            speed: 3.0,
            bearing: 90.0,
            accuracy: 4.0,
            fix_time_ms,
            batch_size,
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn fresh_fix_is_accepted_as_normal() {
        let source = LocationSource::new();
        process_fix(&source.inner, fix(now_ms() - 1_000, 1)).await;
        let sample = source.latest().await.expect("accepted");
        assert_eq!(sample.temporal_quality, TemporalQuality::Normal);
        assert_eq!(source.counts().await, (1, 0));
    }

    #[tokio::test]
    async fn stale_fix_without_prior_accept_falls_back() {
        let source = LocationSource::new();
        // 10 s old, no prior accepted fix: the dry-spell rule applies.
        process_fix(&source.inner, fix(now_ms() - 10_000, 1)).await;
        let sample = source.latest().await.expect("accepted");
        assert_eq!(sample.temporal_quality, TemporalQuality::StaleFallback);
    }

    #[tokio::test]
    async fn batched_stale_fix_falls_back_even_after_recent_accept() {
        let source = LocationSource::new();
        process_fix(&source.inner, fix(now_ms() - 500, 1)).await;
        // Stale but delivered in a burst of three.
        process_fix(&source.inner, fix(now_ms() - 8_000, 3)).await;
        let sample = source.latest().await.expect("accepted");
        assert_eq!(sample.temporal_quality, TemporalQuality::StaleFallback);
        assert_eq!(source.counts().await, (2, 0));
    }

    #[tokio::test]
    async fn stale_single_fix_after_recent_accept_is_discarded() {
        let source = LocationSource::new();
        process_fix(&source.inner, fix(now_ms() - 500, 1)).await;
        process_fix(&source.inner, fix(now_ms() - 8_000, 1)).await;
        // The stale fix was dropped; latest still holds the fresh one.
        let sample = source.latest().await.expect("first accept");
        assert_eq!(sample.temporal_quality, TemporalQuality::Normal);
        assert_eq!(source.counts().await, (1, 1));
    }

    #[tokio::test]
    async fn slow_cadence_accepts_stale_fixes() {
        let source = LocationSource::new();
        // Seed the cadence window with slow (3 s) callback intervals.
        {
            let mut inner = source.inner.write().await;
            let base = Instant::now();
            for _ in 0..CADENCE_WINDOW {
                inner.recent_intervals.push_back(Duration::from_secs(3));
            }
            inner.last_callback_at = Some(base);
            inner.last_accept_at = Some(base);
        }
        process_fix(&source.inner, fix(now_ms() - 8_000, 1)).await;
        let sample = source.latest().await.expect("accepted");
        assert_eq!(sample.temporal_quality, TemporalQuality::StaleCadence);
    }

    #[tokio::test]
    async fn imu_reports_impact_once_per_excursion() {
        let source = ImuSource::new();
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        source.start(10.0, feed_rx, events_tx);

        let quiet = RawImu {
            accel: (0.0, 0.0, 9.8),
            gyro: (0.0, 0.0, 0.0),
            mag: None,
            linear_accel: None,
            gravity: None,
            rotation: None,
            orientation: None,
        };
        let hit = RawImu {
            accel: (30.0, 0.0, 9.8),
            ..quiet.clone()
        };

        feed_tx.send(quiet.clone()).await.unwrap();
        feed_tx.send(hit.clone()).await.unwrap();
        // Still above threshold: no second event until re-armed.
        feed_tx.send(hit).await.unwrap();
        feed_tx.send(quiet.clone()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match event {
            AgentEvent::Impact { magnitude_ms2, .. } => assert!(magnitude_ms2 > IMPACT_THRESHOLD_MS2),
            other => panic!("unexpected event {other:?}"),
        }
        // Allow the consumer to drain; no further impact is pending.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events_rx.try_recv().is_err());

        let sample = source.latest().await.expect("latest imu");
        assert!((sample.accel.magnitude - 9.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_optional_imu_channels_are_not_fatal() {
        let source = ImuSource::new();
        let (feed_tx, feed_rx) = mpsc::channel(4);
        let (events_tx, _events_rx) = mpsc::channel(4);
        source.start(10.0, feed_rx, events_tx);

        feed_tx
            .send(RawImu {
                accel: (0.1, 0.2, 9.8),
                gyro: (0.0, 0.0, 0.1),
                mag: None,
                linear_accel: None,
                gravity: None,
                rotation: None,
                orientation: Some(OrientationSample {
                    azimuth: 270.0,
                    pitch: 1.0,
                    roll: -2.0,
                }),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let sample = source.latest().await.expect("latest imu");
        assert!(sample.mag.is_none());
        assert!(sample.rotation.is_none());
        let orientation = source.latest_orientation().await.expect("orientation");
        assert_eq!(orientation.azimuth, 270.0);
    }
}
