//! MQTT link to the tracking broker: one long-lived session with managed
//! reconnection. The driver task owns the rumqttc event loop, publishes the
//! connection state on a watch channel, and correlates QoS=1 PubAcks back to
//! in-flight publishes. Publishes are serialized internally, so packet-id
//! assignment observed on the event loop is FIFO with respect to callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{oneshot, watch, Mutex};

use crate::config::{MQTT_BACKOFF_CAP, MQTT_KEEP_ALIVE};

/// Delivery guarantee requested for one publish.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    fn to_rumqttc(self) -> QoS {
        match self {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("broker not connected")]
    NotConnected,
    #[error("no acknowledgment within the deadline")]
    Timeout,
    #[error("broker session closed")]
    SessionClosed,
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// The seam the delivery engine and sync orchestrator publish through. The
/// broker never learns who consumes it; consumers subscribe to the
/// connection signal, which breaks the notification cycle.
#[async_trait]
pub trait Broker: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Current value on subscribe, then every transition.
    fn subscribe_connection(&self) -> watch::Receiver<bool>;
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        deadline: Duration,
    ) -> Result<(), PublishError>;
}

/// In-flight QoS=1 publishes awaiting their PubAck. `unassigned` holds
/// waiters whose packet id has not yet appeared on the event loop.
#[derive(Default)]
struct PendingAcks {
    unassigned: std::collections::VecDeque<oneshot::Sender<()>>,
    assigned: HashMap<u16, oneshot::Sender<()>>,
}

impl PendingAcks {
    fn fail_all(&mut self) {
        // Dropping the senders wakes every waiter with a closed channel.
        self.unassigned.clear();
        self.assigned.clear();
    }
}

pub struct MqttLink {
    client: AsyncClient,
    connected_rx: watch::Receiver<bool>,
    pending: Arc<StdMutex<PendingAcks>>,
    publish_serial: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MqttLink {
    /// Start the session and its driver task. The returned link is usable
    /// immediately; publishes fail `NotConnected` until the first ConnAck.
    pub fn connect(client_id: &str, host: &str, port: u16) -> Arc<Self> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        // The server retains subscription state and unacknowledged QoS=1
        // deliveries across reconnects for this client id.
        options.set_clean_session(false);

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(StdMutex::new(PendingAcks::default()));

        let link = Arc::new(Self {
            client,
            connected_rx,
            pending: Arc::clone(&pending),
            publish_serial: Mutex::new(()),
            shutdown_tx,
        });

        tokio::spawn(drive_event_loop(
            event_loop,
            connected_tx,
            pending,
            shutdown_rx,
        ));
        link
    }

    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!("disconnect request failed: {err}");
        }
    }
}

#[async_trait]
impl Broker for MqttLink {
    fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        deadline: Duration,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        // Serialize publishes so the driver can assign packet ids FIFO.
        let _serial = self.publish_serial.lock().await;

        let ack_rx = if qos == Qos::AtLeastOnce {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().expect("pending lock").unassigned.push_back(tx);
            Some(rx)
        } else {
            None
        };

        if let Err(err) = self
            .client
            .publish(topic, qos.to_rumqttc(), false, payload)
            .await
        {
            if ack_rx.is_some() {
                // The waiter we just registered is the newest unassigned one.
                self.pending
                    .lock()
                    .expect("pending lock")
                    .unassigned
                    .pop_back();
            }
            return Err(PublishError::Rejected(err.to_string()));
        }

        let Some(ack_rx) = ack_rx else {
            return Ok(());
        };
        match tokio::time::timeout(deadline, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            // Sender dropped: the connection went down before the ack.
            Ok(Err(_)) => Err(PublishError::SessionClosed),
            Err(_) => Err(PublishError::Timeout),
        }
    }
}

async fn drive_event_loop(
    mut event_loop: rumqttc::EventLoop,
    connected_tx: watch::Sender<bool>,
    pending: Arc<StdMutex<PendingAcks>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(Duration::from_secs(1), MQTT_BACKOFF_CAP);
    loop {
        let event = tokio::select! {
            event = event_loop.poll() => event,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    connected_tx.send_replace(false);
                    pending.lock().expect("pending lock").fail_all();
                    return;
                }
                continue;
            }
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(session_present = ack.session_present, "broker connected");
                backoff.reset();
                connected_tx.send_replace(true);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let mut pending = pending.lock().expect("pending lock");
                if let Some(waiter) = pending.unassigned.pop_front() {
                    pending.assigned.insert(pkid, waiter);
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let waiter = pending.lock().expect("pending lock").assigned.remove(&ack.pkid);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
            }
            Ok(_) => {}
            Err(err) => {
                if connected_tx.send_replace(false) {
                    tracing::warn!("broker connection lost: {err}");
                }
                pending.lock().expect("pending lock").fail_all();
                let delay = backoff.next_delay();
                tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Exponential backoff with full jitter, capped.
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let ceiling = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jittered = ceiling.mul_f64(rand::thread_rng().gen_range(0.5..=1.0));
        jittered.max(self.base.mul_f64(0.5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(120));
        let mut previous_ceiling = Duration::ZERO;
        for _ in 0..12 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(120));
            assert!(delay >= Duration::from_millis(500));
            previous_ceiling = previous_ceiling.max(delay);
        }
        // After many attempts the ceiling has reached the cap region.
        assert!(previous_ceiling >= Duration::from_secs(30));
    }

    #[test]
    fn backoff_reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(120));
        for _ in 0..8 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs(1));
    }

    #[test]
    fn pending_acks_assign_fifo() {
        let mut pending = PendingAcks::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.unassigned.push_back(tx1);
        pending.unassigned.push_back(tx2);

        // Driver sees pkid 7 first, then 8.
        let first = pending.unassigned.pop_front().unwrap();
        pending.assigned.insert(7, first);
        let second = pending.unassigned.pop_front().unwrap();
        pending.assigned.insert(8, second);

        pending.assigned.remove(&7).unwrap().send(()).unwrap();
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        pending.fail_all();
        assert!(rx2.try_recv().is_err());
    }
}
