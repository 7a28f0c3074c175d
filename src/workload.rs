//! Workload client: the persistent-session connection to the broker under
//! test, publishing and receiving the sequenced message stream.
//!
//! The client subscribes to its own data topic, so every message it publishes
//! comes back to it. Arrival-side bookkeeping lives in [`ArrivalTracker`];
//! connection loss is survivable and handled by the listener's reconnect
//! loop.

use std::sync::Arc;

use rumqttc::{AsyncClient, Event, EventLoop, Packet, Publish, QoS};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::TestConfig;
use crate::error::HarnessError;
use crate::state::DriverShared;
use crate::transport;

/// Delay between publish retries while the broker is unreachable.
pub const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delay before re-polling the event loop after a connection loss.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Validates and counts arriving workload messages.
///
/// The error policy is QoS-aware. A delivery QoS differing from the
/// subscription QoS is always an error, and on a mismatch the sequence
/// number is not checked. A sequence discontinuity is an error at QoS 2
/// (exactly once), an error only when messages are skipped at QoS 1
/// (duplicates are legal), and never an error at QoS 0.
pub struct ArrivalTracker {
    shared: Arc<DriverShared>,
    qos: QoS,
    sample: u32,
}

impl ArrivalTracker {
    #[must_use]
    pub fn new(shared: Arc<DriverShared>, qos: QoS, sample: u32) -> Self {
        Self { shared, qos, sample }
    }

    /// Processes one arriving message: validates it, counts it, and closes
    /// the calibration measurement when the sample size is reached.
    pub fn on_message(&self, publish: &Publish) {
        let payload = String::from_utf8_lossy(&publish.payload);
        let expected = self.shared.arrived() + 1;

        match parse_sequence(&payload) {
            None => {
                warn!("unparseable workload payload {payload:?}");
                self.shared.record_error();
            }
            Some(seq) => {
                if publish.qos != self.qos {
                    warn!(
                        "message {seq} arrived at QoS {:?}, expected {:?}",
                        publish.qos, self.qos
                    );
                    self.shared.record_error();
                } else if seq != expected && self.gap_is_error(seq, expected) {
                    warn!("sequence error: expected message {expected}, got {seq}");
                    self.shared.record_error();
                }
            }
        }

        let arrived = self.shared.record_arrival();
        if self.shared.is_measuring() && arrived == self.sample {
            self.shared.record_roundtrip();
            debug!(
                "calibration sample complete: {} messages in {}ms",
                self.sample,
                self.shared.roundtrip_ms()
            );
        }
    }

    fn gap_is_error(&self, seq: u32, expected: u32) -> bool {
        match self.qos {
            QoS::ExactlyOnce => true,
            QoS::AtLeastOnce => seq > expected,
            QoS::AtMostOnce => false,
        }
    }
}

/// Extracts the sequence number from a `"message number {n}"` payload.
fn parse_sequence(payload: &str) -> Option<u32> {
    payload.split_whitespace().nth(2)?.parse().ok()
}

/// The driver's connection to the broker under test.
pub struct WorkloadClient {
    client: AsyncClient,
    topic: String,
    qos: QoS,
    retained: bool,
    shared: Arc<DriverShared>,
    listener: JoinHandle<()>,
}

impl WorkloadClient {
    /// Connects with a persistent session and subscribes to the driver's
    /// data topic.
    ///
    /// When a failover list is configured, addresses are tried in priority
    /// order and the first one that answers with a CONNACK wins; subsequent
    /// reconnections stick with the established address.
    pub async fn connect(
        config: &TestConfig,
        index: u32,
        shared: Arc<DriverShared>,
    ) -> Result<Self, HarnessError> {
        let client_id = config.client_id(index);
        let topic = config.data_topic(index);

        let mut established = None;
        for addr in config.workload_addresses() {
            let (client, mut eventloop) = transport::connect_pair(
                addr,
                &client_id,
                false,
                config.username.as_deref(),
                config.password.as_deref(),
            );
            match transport::await_connack(&mut eventloop).await {
                Ok(ack) => {
                    debug!("workload connected to {addr} ({:?})", ack.code);
                    established = Some((client, eventloop));
                    break;
                }
                Err(e) => warn!("workload connection to {addr} failed: {e}"),
            }
        }

        let (client, mut eventloop) = established.ok_or_else(|| {
            HarnessError::Connection("no workload broker address reachable".to_string())
        })?;

        client.subscribe(&topic, config.qos).await?;

        let tracker = ArrivalTracker::new(shared.clone(), config.qos, config.calibration_sample);
        // A persistent session may replay queued messages before the SUBACK;
        // those still count.
        transport::await_suback(&mut eventloop, |publish| tracker.on_message(&publish)).await?;
        info!("workload client {client_id} subscribed to {topic}");

        let listener = tokio::spawn(listen(
            eventloop,
            client.clone(),
            topic.clone(),
            config.qos,
            tracker,
            shared.clone(),
        ));

        Ok(Self {
            client,
            topic,
            qos: config.qos,
            retained: config.retained,
            shared,
            listener,
        })
    }

    /// Publishes `"message number {seq}"`, retrying once per second until it
    /// is accepted or the driver is stopping.
    pub async fn publish_sequenced(&self, seq: u32) -> Result<(), HarnessError> {
        let payload = format!("message number {seq}");
        loop {
            if self.shared.is_stopping() {
                return Err(HarnessError::Stopped);
            }
            match self
                .client
                .publish(&self.topic, self.qos, self.retained, payload.as_bytes())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("publish of message {seq} failed ({e}), retrying");
                    sleep(PUBLISH_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Disconnects and tears down the listener.
    pub async fn finish(self) {
        let _ = self.client.disconnect().await;
        self.listener.abort();
    }
}

async fn listen(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    qos: QoS,
    tracker: ArrivalTracker,
    shared: Arc<DriverShared>,
) {
    let mut connected = true;
    loop {
        if shared.is_stopping() {
            break;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => tracker.on_message(&publish),
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if !connected {
                    info!(
                        "workload connection re-established, {} messages arrived so far",
                        shared.arrived()
                    );
                    connected = true;
                    if !ack.session_present {
                        warn!("broker did not resume the session, resubscribing to {topic}");
                        if let Err(e) = client.subscribe(&topic, qos).await {
                            warn!("resubscribe failed: {e}");
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                connected = false;
                if shared.is_stopping() {
                    break;
                }
                warn!(
                    "workload connection lost ({e}), {} messages arrived so far",
                    shared.arrived()
                );
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn message(seq: u32, qos: QoS) -> Publish {
        Publish::new("t", qos, format!("message number {seq}"))
    }

    fn tracker(qos: QoS) -> (Arc<DriverShared>, ArrivalTracker) {
        let shared = Arc::new(DriverShared::new());
        let tracker = ArrivalTracker::new(shared.clone(), qos, 100);
        (shared, tracker)
    }

    #[test]
    fn sequence_parser_reads_trailing_number() {
        assert_eq!(parse_sequence("message number 42"), Some(42));
        assert_eq!(parse_sequence("message number x"), None);
        assert_eq!(parse_sequence("nonsense"), None);
    }

    #[test]
    fn in_order_stream_is_clean() {
        let (shared, tracker) = tracker(QoS::ExactlyOnce);
        for seq in 1..=5 {
            tracker.on_message(&message(seq, QoS::ExactlyOnce));
        }
        assert_eq!(shared.arrived(), 5);
        assert_eq!(shared.errors(), 0);
    }

    #[test]
    fn qos_mismatch_is_an_error_and_skips_sequence_check() {
        let (shared, tracker) = tracker(QoS::ExactlyOnce);
        // Wrong QoS and wrong sequence: only the mismatch counts.
        tracker.on_message(&message(7, QoS::AtMostOnce));
        assert_eq!(shared.errors(), 1);
        assert_eq!(shared.arrived(), 1);
    }

    #[test]
    fn exactly_once_rejects_gaps_and_duplicates() {
        let (shared, tracker) = tracker(QoS::ExactlyOnce);
        tracker.on_message(&message(1, QoS::ExactlyOnce));
        tracker.on_message(&message(3, QoS::ExactlyOnce));
        assert_eq!(shared.errors(), 1);
        tracker.on_message(&message(2, QoS::ExactlyOnce));
        assert_eq!(shared.errors(), 2);
    }

    #[test]
    fn at_least_once_tolerates_duplicates_but_not_skips() {
        let (shared, tracker) = tracker(QoS::AtLeastOnce);
        tracker.on_message(&message(1, QoS::AtLeastOnce));
        tracker.on_message(&message(2, QoS::AtLeastOnce));
        // Redelivery of an earlier message is legal at QoS 1.
        tracker.on_message(&message(2, QoS::AtLeastOnce));
        assert_eq!(shared.errors(), 0);
        // A skipped message is not.
        tracker.on_message(&message(6, QoS::AtLeastOnce));
        assert_eq!(shared.errors(), 1);
        assert_eq!(shared.arrived(), 4);
    }

    #[test]
    fn at_most_once_never_flags_sequence_errors() {
        let (shared, tracker) = tracker(QoS::AtMostOnce);
        tracker.on_message(&message(5, QoS::AtMostOnce));
        tracker.on_message(&message(2, QoS::AtMostOnce));
        assert_eq!(shared.errors(), 0);
        assert_eq!(shared.arrived(), 2);
    }

    #[test]
    fn unparseable_payload_is_an_error() {
        let (shared, tracker) = tracker(QoS::ExactlyOnce);
        tracker.on_message(&Publish::new("t", QoS::ExactlyOnce, "garbage"));
        assert_eq!(shared.errors(), 1);
        assert_eq!(shared.arrived(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_closes_at_sample_size() {
        let shared = Arc::new(DriverShared::new());
        let tracker = ArrivalTracker::new(shared.clone(), QoS::ExactlyOnce, 3);

        shared.begin_measurement(Instant::now());
        tokio::time::sleep(Duration::from_millis(500)).await;
        for seq in 1..=3 {
            tracker.on_message(&message(seq, QoS::ExactlyOnce));
        }
        assert_eq!(shared.roundtrip_ms(), 500);
    }
}
