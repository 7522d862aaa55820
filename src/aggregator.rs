//! 1 Hz sample aggregator: on each tick, snapshot the latest value from
//! every source, annotate with identity and geofence context, and hand one
//! record to the delivery engine. A missed tick is skipped, never replayed;
//! coverage is expressed by `temporal_quality`, not by catch-up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracker_core::{TelemetryRecord, TransmissionMode};
use uuid::Uuid;

use crate::delivery::DeliveryEngine;
use crate::geofence::GeofenceService;
use crate::sources::{ImuSource, LocationSource, SystemSource};

/// Tick pause after a durable-write failure, so a broken disk does not spin
/// the loop while the alarm is raised.
const STORAGE_FAILURE_PAUSE: Duration = Duration::from_secs(5);

pub struct Aggregator {
    pub device_id: String,
    pub operator_id: String,
    pub location: Arc<LocationSource>,
    pub imu: Arc<ImuSource>,
    pub system: Arc<SystemSource>,
    pub geofence: Arc<GeofenceService>,
    pub delivery: Arc<DeliveryEngine>,
}

impl Aggregator {
    /// Run the tick loop until the shutdown signal flips. The returned
    /// handle finishing early means the pipeline died.
    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("aggregator stopping");
                            return;
                        }
                        continue;
                    }
                }

                let record = self.build_record().await;
                match self.delivery.deliver(record).await {
                    Ok(_mode) => {}
                    Err(err) => {
                        // Loud failure: pause the tick and leave the storage
                        // alarm raised for the watchdog and status surface.
                        tracing::error!("record delivery failed: {err:#}");
                        tokio::time::sleep(STORAGE_FAILURE_PAUSE).await;
                    }
                }
            }
        })
    }

    /// A tick is emitted even when sources are empty; absent samples
    /// serialize as null.
    async fn build_record(&self) -> TelemetryRecord {
        TelemetryRecord {
            message_id: Uuid::new_v4(),
            timestamp_ms: Utc::now().timestamp_millis(),
            device_id: self.device_id.clone(),
            operator_id: self.operator_id.clone(),
            gps: self.location.latest().await,
            imu: self.imu.latest().await,
            orientation: self.imu.latest_orientation().await,
            system: self.system.latest().await,
            geofence_context: self.geofence.current_context().await,
            transmission_mode: TransmissionMode::Online,
        }
    }
}
