//! Delivery engine: routes each record to publish-or-enqueue and drains the
//! durable queue on reconnect. At most one drain runs per device; the drain
//! lock is acquired with try_lock and contenders return silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tracker_core::{AgentEvent, TelemetryRecord, TransmissionMode};

use crate::broker::{Broker, Qos};
use crate::config::{
    DELIVERY_RETRY_CAP, DRAIN_BATCH_PAUSE, DRAIN_BATCH_SIZE, DRAIN_CYCLE_CAP, PUBLISH_DEADLINE,
};
use crate::store::{QueueLimits, Store};

/// Outcome of one drain cycle, reported to the sync orchestrator and logs.
#[derive(Clone, Copy, Default, Debug)]
pub struct DrainReport {
    pub delivered: u64,
    pub events_delivered: u64,
    pub discarded: u64,
    pub remaining: i64,
    /// False when a publish failure interrupted the cycle.
    pub completed: bool,
    /// True when another drain already held the lock.
    pub skipped: bool,
}

pub struct DeliveryEngine {
    store: Store,
    broker: Arc<dyn Broker>,
    telemetry_topic: String,
    events_topic: String,
    geofence_topic: String,
    limits: QueueLimits,
    drain_lock: Mutex<()>,
    storage_alarm: AtomicBool,
}

impl DeliveryEngine {
    pub fn new(
        store: Store,
        broker: Arc<dyn Broker>,
        device_id: &str,
        limits: QueueLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            telemetry_topic: tracker_core::telemetry_topic(device_id),
            events_topic: tracker_core::events_topic(device_id),
            geofence_topic: tracker_core::geofence_topic(device_id),
            limits,
            drain_lock: Mutex::new(()),
            storage_alarm: AtomicBool::new(false),
        })
    }

    /// True while the durable path is failing; the watchdog and status
    /// surface report it.
    pub fn storage_alarmed(&self) -> bool {
        self.storage_alarm.load(Ordering::Relaxed)
    }

    /// Route one record from the aggregator. Online publishes get a short
    /// deadline; anything else lands in the durable queue, already tagged
    /// for the flush path so drained payloads go out verbatim.
    pub async fn deliver(&self, mut record: TelemetryRecord) -> Result<TransmissionMode> {
        if self.broker.is_connected() {
            record.transmission_mode = TransmissionMode::Online;
            let payload = serde_json::to_vec(&record).context("serializing record")?;
            match self
                .broker
                .publish(&self.telemetry_topic, payload, Qos::AtLeastOnce, PUBLISH_DEADLINE)
                .await
            {
                Ok(()) => return Ok(TransmissionMode::Online),
                Err(err) => {
                    tracing::debug!(message_id = %record.message_id, "online publish failed, queueing: {err}");
                }
            }
        }

        record.transmission_mode = TransmissionMode::OfflineFlush;
        match self.store.enqueue(&record).await {
            Ok(_) => {
                self.storage_alarm.store(false, Ordering::Relaxed);
                Ok(TransmissionMode::OfflineFlush)
            }
            Err(err) => {
                self.storage_alarm.store(true, Ordering::Relaxed);
                Err(err.context("durable enqueue failed"))
            }
        }
    }

    /// Best-effort publication of a discrete agent event (login, impact).
    pub async fn publish_agent_event(&self, event: &AgentEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("serializing agent event")?;
        self.broker
            .publish(&self.events_topic, payload, Qos::AtLeastOnce, PUBLISH_DEADLINE)
            .await
            .map_err(|err| anyhow::anyhow!("event publish failed: {err}"))
    }

    /// Watch connection transitions and drain on every connect.
    pub fn spawn_connection_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut connection = engine.broker.subscribe_connection();
        tokio::spawn(async move {
            // An already-up connection at subscribe time drains immediately.
            if *connection.borrow_and_update() {
                engine.drain_and_log().await;
            }
            while connection.changed().await.is_ok() {
                if *connection.borrow_and_update() {
                    engine.drain_and_log().await;
                }
            }
        })
    }

    async fn drain_and_log(&self) {
        match self.drain().await {
            Ok(report) if report.skipped => {}
            Ok(report) => {
                if report.delivered > 0 || report.events_delivered > 0 {
                    tracing::info!(
                        delivered = report.delivered,
                        events = report.events_delivered,
                        remaining = report.remaining,
                        completed = report.completed,
                        "drain cycle finished"
                    );
                }
            }
            Err(err) => tracing::warn!("drain cycle failed: {err}"),
        }
    }

    /// One drain cycle: FIFO batches of queued telemetry, then unsent
    /// geofence events, then queue maintenance. Returns immediately with
    /// `skipped` when a cycle is already running.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            return Ok(DrainReport {
                skipped: true,
                completed: true,
                ..DrainReport::default()
            });
        };

        let mut report = DrainReport {
            completed: true,
            ..DrainReport::default()
        };

        while (report.delivered as i64) < DRAIN_CYCLE_CAP {
            let batch = self.store.peek_oldest(DRAIN_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            let mut acked: Vec<String> = Vec::with_capacity(batch.len());
            for entry in &batch {
                match self
                    .broker
                    .publish(
                        &self.telemetry_topic,
                        entry.payload.clone().into_bytes(),
                        Qos::AtLeastOnce,
                        PUBLISH_DEADLINE,
                    )
                    .await
                {
                    Ok(()) => {
                        acked.push(entry.message_id.clone());
                        report.delivered += 1;
                    }
                    Err(err) => {
                        let retries = self.store.increment_retry(entry.entry_id).await?;
                        if retries >= DELIVERY_RETRY_CAP {
                            tracing::error!(
                                message_id = %entry.message_id,
                                retries,
                                "queue entry exceeded retry cap; discarding"
                            );
                            self.store.discard_entry(entry.entry_id).await?;
                            report.discarded += 1;
                        } else {
                            tracing::debug!(message_id = %entry.message_id, "drain publish failed: {err}");
                        }
                        report.completed = false;
                        break;
                    }
                }
            }
            // Acknowledged ids are deleted before any retry so a crash here
            // at worst re-sends entries the server deduplicates.
            if !acked.is_empty() {
                self.store.delete_by_message_ids(&acked).await?;
            }
            if !report.completed {
                break;
            }
            tokio::time::sleep(DRAIN_BATCH_PAUSE).await;
        }

        if report.completed {
            report.events_delivered = self.drain_geofence_events(&mut report).await?;
        }

        self.run_maintenance().await?;
        report.remaining = self.store.queue_count().await?;
        Ok(report)
    }

    async fn drain_geofence_events(&self, report: &mut DrainReport) -> Result<u64> {
        let mut delivered = 0u64;
        loop {
            let batch = self.store.unsent_geofence_events(DRAIN_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            for stored in &batch {
                let payload =
                    serde_json::to_vec(&stored.event).context("serializing geofence event")?;
                match self
                    .broker
                    .publish(&self.geofence_topic, payload, Qos::AtLeastOnce, PUBLISH_DEADLINE)
                    .await
                {
                    Ok(()) => {
                        self.store.mark_event_sent(stored.event.event_id).await?;
                        delivered += 1;
                    }
                    Err(err) => {
                        let retries =
                            self.store.increment_event_retry(stored.event.event_id).await?;
                        if retries >= DELIVERY_RETRY_CAP {
                            tracing::error!(
                                event_id = %stored.event.event_id,
                                retries,
                                "geofence event exceeded retry cap; discarding"
                            );
                            self.store.discard_event(stored.event.event_id).await?;
                            report.discarded += 1;
                        } else {
                            tracing::debug!(event_id = %stored.event.event_id, "event publish failed: {err}");
                        }
                        report.completed = false;
                        return Ok(delivered);
                    }
                }
            }
            tokio::time::sleep(DRAIN_BATCH_PAUSE).await;
        }
        Ok(delivered)
    }

    /// Retention pass shared by the drain cycle and the periodic schedule.
    pub async fn run_maintenance(&self) -> Result<()> {
        self.store.queue_maintenance(&self.limits).await?;
        let event_cutoff = Utc::now().timestamp_millis() - self.limits.ttl_ms;
        self.store.purge_sent_events(event_cutoff).await?;
        Ok(())
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }
}
