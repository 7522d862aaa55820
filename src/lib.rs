//! Aura mobile telemetry agent.
//! - Samples GPS/IMU/system sources at 1 Hz into telemetry records.
//! - Publishes records over MQTT at QoS=1; queues durably when offline.
//! - Replays the queue in FIFO batches on reconnect under a drain lock.
//! - Periodically syncs operators/geofences from the configuration service.
//! - A supervisor keeps the pipeline alive and exposes a local status surface.

pub mod aggregator;
pub mod broker;
pub mod config;
pub mod delivery;
pub mod geofence;
pub mod sources;
pub mod store;
pub mod supervisor;
pub mod sync;
