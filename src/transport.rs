//! Shared rumqttc plumbing for the control and workload connections.

use rumqttc::{AsyncClient, ConnAck, Event, EventLoop, MqttOptions, Packet, Publish};
use tokio::time::{timeout, Duration};

use crate::config::BrokerAddr;
use crate::error::HarnessError;

/// Upper bound on a single connection establishment attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Request-channel capacity for both connections; the event loops are polled
/// continuously, so a small buffer suffices.
pub const CHANNEL_CAPACITY: usize = 10;

/// Builds client options for one endpoint.
#[must_use]
pub fn mqtt_options(
    addr: &BrokerAddr,
    client_id: &str,
    clean_session: bool,
    username: Option<&str>,
    password: Option<&str>,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &addr.host, addr.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(clean_session);
    if let (Some(username), Some(password)) = (username, password) {
        options.set_credentials(username, password);
    }
    options
}

/// Creates a client/event-loop pair for one endpoint.
#[must_use]
pub fn connect_pair(
    addr: &BrokerAddr,
    client_id: &str,
    clean_session: bool,
    username: Option<&str>,
    password: Option<&str>,
) -> (AsyncClient, EventLoop) {
    let options = mqtt_options(addr, client_id, clean_session, username, password);
    AsyncClient::new(options, CHANNEL_CAPACITY)
}

/// Polls the event loop until the broker acknowledges the connection.
pub async fn await_connack(eventloop: &mut EventLoop) -> Result<ConnAck, HarnessError> {
    let deadline = timeout(CONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                Ok(_) => continue,
                Err(e) => return Err(HarnessError::Connection(e.to_string())),
            }
        }
    });

    deadline
        .await
        .map_err(|_| HarnessError::Connection("timed out waiting for CONNACK".to_string()))?
}

/// Polls the event loop until a SUBACK arrives.
///
/// Messages a persistent session delivers ahead of the SUBACK are routed to
/// `on_publish` rather than dropped.
pub async fn await_suback(
    eventloop: &mut EventLoop,
    mut on_publish: impl FnMut(Publish),
) -> Result<(), HarnessError> {
    let deadline = timeout(CONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(_))) => return Ok(()),
                Ok(Event::Incoming(Packet::Publish(publish))) => on_publish(publish),
                Ok(_) => continue,
                Err(e) => return Err(HarnessError::Connection(e.to_string())),
            }
        }
    });

    deadline
        .await
        .map_err(|_| HarnessError::Connection("timed out waiting for SUBACK".to_string()))?
}
