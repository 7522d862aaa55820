//! Lifecycle supervisor: builds the pipeline from explicit handles, keeps it
//! alive while tracking is enabled, watchdog-restarts on anomaly, and serves
//! the local status surface (the agent's "foreground notification").

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tower_http::trace::TraceLayer;
use tracker_core::AgentEvent;

use crate::aggregator::Aggregator;
use crate::broker::{Broker, MqttLink};
use crate::config::{AgentConfig, RESTART_DEBOUNCE, WATCHDOG_INTERVAL};
use crate::delivery::DeliveryEngine;
use crate::geofence::GeofenceService;
use crate::sources::{
    feed_channels, FeedSenders, IdleFeed, ImuSource, LocationFeed, LocationSource, SimulatedFeed,
    SystemSource,
};
use crate::store::{QueueLimits, Store};
use crate::sync::{HttpConfigSource, SyncOrchestrator};

/// Watchdog freshness bounds.
const GPS_STALE_AFTER: Duration = Duration::from_secs(120);
const IMU_STALE_AFTER: Duration = Duration::from_secs(60);
/// Pause before restarting a pipeline that died on a fatal error.
const FATAL_RESTART_DELAY: Duration = Duration::from_secs(2);

/// One running pipeline instance and the handles needed to stop or probe it.
struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    location: Arc<LocationSource>,
    imu: Arc<ImuSource>,
    // Keeps the feed senders alive; dropping them ends the source tasks.
    _feeds: FeedSenders,
    started_at: Instant,
}

pub struct Supervisor {
    cfg: AgentConfig,
    store: Store,
    broker: Arc<MqttLink>,
    delivery: Arc<DeliveryEngine>,
    geofence: Arc<GeofenceService>,
    pipeline: RwLock<Option<Pipeline>>,
    restart_gate: Mutex<Option<Instant>>,
    pipeline_died_tx: mpsc::Sender<()>,
}

impl Supervisor {
    /// Wire every component from explicit handles and run until ctrl-c.
    pub async fn run(cfg: AgentConfig) -> Result<()> {
        let store = Store::open(&cfg.database_path).await?;
        store.seed_config(&cfg).await?;
        let device = store.device_config().await?;
        tracing::info!(
            device_id = %device.device_id,
            tracking_enabled = device.tracking_enabled,
            "supervisor starting"
        );

        let broker = MqttLink::connect(&device.device_id, &device.mqtt_host, device.mqtt_port);
        let delivery = DeliveryEngine::new(
            store.clone(),
            broker.clone() as Arc<dyn Broker>,
            &device.device_id,
            QueueLimits::default(),
        );
        let drain_watcher = delivery.spawn_connection_watcher();

        let geofence = GeofenceService::new(store.clone()).await?;
        let config_source = Arc::new(HttpConfigSource::new(&cfg.config_url)?);
        let sync = SyncOrchestrator::new(
            store.clone(),
            Arc::clone(&delivery),
            Arc::clone(&geofence),
            broker.clone() as Arc<dyn Broker>,
            config_source,
        );
        let (service_shutdown_tx, service_shutdown_rx) = watch::channel(false);
        let sync_task = sync.spawn(service_shutdown_rx);

        let (pipeline_died_tx, mut pipeline_died_rx) = mpsc::channel(4);
        let supervisor = Arc::new(Self {
            cfg,
            store: store.clone(),
            broker,
            delivery,
            geofence,
            pipeline: RwLock::new(None),
            restart_gate: Mutex::new(None),
            pipeline_died_tx,
        });

        let status_task = supervisor.spawn_status_server()?;

        // Boot behavior: start only when the persisted flag says tracking
        // was active, with the restart debounce applied.
        if device.tracking_enabled {
            supervisor.start_pipeline().await?;
        }

        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so boot is not treated
        // as a watchdog pass.
        watchdog.tick().await;

        loop {
            tokio::select! {
                _ = watchdog.tick() => {
                    if let Err(err) = supervisor.watchdog_pass().await {
                        tracing::warn!("watchdog pass failed: {err:#}");
                    }
                }
                Some(()) = pipeline_died_rx.recv() => {
                    tracing::error!("pipeline died unexpectedly; restarting shortly");
                    tokio::time::sleep(FATAL_RESTART_DELAY).await;
                    if let Err(err) = supervisor.start_pipeline().await {
                        tracing::error!("pipeline restart failed: {err:#}");
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listening for shutdown signal")?;
                    tracing::info!("shutdown requested");
                    break;
                }
            }
        }

        // Stop order: tick scheduler first, grace for in-flight publishes,
        // then the services, broker, and store.
        supervisor.stop_pipeline().await;
        let _ = service_shutdown_tx.send(true);
        sync_task.abort();
        drain_watcher.abort();
        status_task.abort();
        supervisor.broker.disconnect().await;
        store.close().await;
        Ok(())
    }

    /// Assemble sources, feeds, and the tick loop. Debounced: a start within
    /// 30 s of the previous one waits out the remainder.
    async fn start_pipeline(self: &Arc<Self>) -> Result<()> {
        {
            let pipeline = self.pipeline.read().await;
            if let Some(p) = pipeline.as_ref() {
                if p.running.load(Ordering::Relaxed) {
                    return Ok(());
                }
            }
        }

        {
            let mut gate = self.restart_gate.lock().await;
            if let Some(last) = *gate {
                let since = last.elapsed();
                if since < RESTART_DEBOUNCE {
                    let wait = RESTART_DEBOUNCE - since;
                    tracing::info!(wait_s = wait.as_secs(), "debouncing pipeline restart");
                    tokio::time::sleep(wait).await;
                }
            }
            *gate = Some(Instant::now());
        }

        let device = self.store.device_config().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (feed_senders, feed_receivers) = feed_channels();

        let location_feed: Arc<dyn LocationFeed> = if self.cfg.simulated_sensors {
            SimulatedFeed::start(&feed_senders, (-19.9245, -43.9352), shutdown_rx.clone())
        } else {
            // Hardware bindings attach through the feed senders; until they
            // do the sources idle and the watchdog reports staleness.
            Arc::new(IdleFeed)
        };

        let location = Arc::new(LocationSource::new());
        let imu = Arc::new(ImuSource::new());
        let system = Arc::new(SystemSource::new());

        self.geofence.start(location.subscribe_fixes());

        let rate = self.cfg.sample_rate_hz;
        location.start(rate, feed_receivers.fix, location_feed);
        let (agent_events_tx, mut agent_events_rx) = mpsc::channel(32);
        imu.start(rate * 5.0, feed_receivers.imu, agent_events_tx);
        system.start(1.0 / 30.0, feed_receivers.system);

        // Discrete events (impact from the IMU) publish best-effort.
        let event_delivery = Arc::clone(&self.delivery);
        tokio::spawn(async move {
            while let Some(event) = agent_events_rx.recv().await {
                if let Err(err) = event_delivery.publish_agent_event(&event).await {
                    tracing::warn!("agent event publish failed: {err}");
                }
            }
        });

        // Announce the operator session on the events topic.
        let login_delivery = Arc::clone(&self.delivery);
        let operator_id = device.operator_id.clone();
        tokio::spawn(async move {
            let event = AgentEvent::Login {
                operator_id,
                timestamp_ms: Utc::now().timestamp_millis(),
            };
            if let Err(err) = login_delivery.publish_agent_event(&event).await {
                tracing::debug!("login event publish failed: {err}");
            }
        });

        let aggregator = Aggregator {
            device_id: device.device_id.clone(),
            operator_id: device.operator_id,
            location: Arc::clone(&location),
            imu: Arc::clone(&imu),
            system: Arc::clone(&system),
            geofence: Arc::clone(&self.geofence),
            delivery: Arc::clone(&self.delivery),
        };
        let tick_handle = aggregator.spawn(self.cfg.sample_interval(), shutdown_rx);

        let running = Arc::new(AtomicBool::new(true));
        let monitor_running = Arc::clone(&running);
        let died_tx = self.pipeline_died_tx.clone();
        let monitor_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let outcome = tick_handle.await;
            monitor_running.store(false, Ordering::Relaxed);
            let requested = *monitor_shutdown.borrow();
            if !requested {
                if let Err(err) = outcome {
                    tracing::error!("aggregator task panicked: {err}");
                }
                let _ = died_tx.send(()).await;
            }
        });

        *self.pipeline.write().await = Some(Pipeline {
            shutdown_tx,
            running,
            location,
            imu,
            _feeds: feed_senders,
            started_at: Instant::now(),
        });
        tracing::info!("pipeline started");
        Ok(())
    }

    async fn stop_pipeline(&self) {
        let Some(pipeline) = self.pipeline.write().await.take() else {
            return;
        };
        let _ = pipeline.shutdown_tx.send(true);
        // Grace for the in-flight tick and publishes.
        tokio::time::sleep(Duration::from_millis(500)).await;
        tracing::info!(
            uptime_s = pipeline.started_at.elapsed().as_secs(),
            "pipeline stopped"
        );
    }

    /// One watchdog cycle: restart when not running, log other anomalies,
    /// and run the periodic queue maintenance.
    async fn watchdog_pass(self: &Arc<Self>) -> Result<()> {
        let device = self.store.device_config().await?;

        if !device.tracking_enabled {
            let running = self.pipeline.read().await.is_some();
            if running {
                tracing::info!("tracking disabled; stopping pipeline");
                self.stop_pipeline().await;
            }
            return Ok(());
        }

        let needs_restart = {
            let pipeline = self.pipeline.read().await;
            match pipeline.as_ref() {
                None => true,
                Some(p) => !p.running.load(Ordering::Relaxed),
            }
        };
        if needs_restart {
            tracing::warn!("watchdog found pipeline not running; restarting");
            self.start_pipeline().await?;
            return Ok(());
        }

        // Anomaly checks are log-only; only "not running" restarts.
        {
            let pipeline = self.pipeline.read().await;
            if let Some(p) = pipeline.as_ref() {
                match p.location.last_accept_age().await {
                    Some(age) if age > GPS_STALE_AFTER => {
                        tracing::warn!(age_s = age.as_secs(), "no accepted gps fix recently");
                    }
                    None if p.started_at.elapsed() > GPS_STALE_AFTER => {
                        tracing::warn!("no gps fix accepted since pipeline start");
                    }
                    _ => {}
                }
                match p.imu.last_sample_age().await {
                    Some(age) if age > IMU_STALE_AFTER => {
                        tracing::warn!(age_s = age.as_secs(), "no imu sample recently");
                    }
                    None if p.started_at.elapsed() > IMU_STALE_AFTER => {
                        tracing::warn!("no imu sample since pipeline start");
                    }
                    _ => {}
                }
            }
        }

        if !self.broker.is_connected() {
            tracing::warn!("broker connection down");
        }
        if self.delivery.storage_alarmed() || self.geofence.storage_alarmed() {
            tracing::warn!("storage alarm raised");
        }
        let stats = self.store.queue_stats(self.delivery.limits()).await?;
        if stats.critical {
            tracing::error!(count = stats.count, "queue critically full");
        } else if stats.warning {
            tracing::warn!(count = stats.count, "queue above warning threshold");
        }

        self.delivery.run_maintenance().await?;
        Ok(())
    }

    fn spawn_status_server(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let addr: SocketAddr = self
            .cfg
            .status_addr
            .parse()
            .with_context(|| format!("invalid status_addr {}", self.cfg.status_addr))?;
        let state = Arc::clone(self);
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/status", get(status))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        Ok(tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::warn!("status surface unavailable on {addr}: {err}");
                    return;
                }
            };
            tracing::info!("status surface on http://{addr}");
            if let Err(err) = axum::serve(listener, app).await {
                tracing::warn!("status server stopped: {err}");
            }
        }))
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// The agent's user-visible surface: tracking active / degraded / stopped
/// plus the numbers behind the verdict.
async fn status(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    let running = {
        let pipeline = supervisor.pipeline.read().await;
        pipeline
            .as_ref()
            .map(|p| p.running.load(Ordering::Relaxed))
            .unwrap_or(false)
    };
    let broker_connected = supervisor.broker.is_connected();
    let storage_alarm =
        supervisor.delivery.storage_alarmed() || supervisor.geofence.storage_alarmed();
    let stats = supervisor
        .store
        .queue_stats(supervisor.delivery.limits())
        .await
        .ok();

    let degraded = storage_alarm
        || !broker_connected
        || stats.map(|s| s.warning).unwrap_or(false);
    let tracking = if !running {
        "stopped"
    } else if degraded {
        "degraded"
    } else {
        "active"
    };

    Json(serde_json::json!({
        "tracking": tracking,
        "broker_connected": broker_connected,
        "storage_alarm": storage_alarm,
        "queue": stats,
    }))
}
