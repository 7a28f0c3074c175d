//! Control channel: a dedicated connection to the test orchestrator used to
//! exchange synchronization tokens and report verdicts.
//!
//! The orchestrator publishes bare tokens (`start_measuring`, `continue`,
//! `stop`, ...) on `{control_topic}/send`; the driver publishes
//! `"{client_id}: {message}"` on `{control_topic}/receive`. Loss of the
//! control connection is fatal to the driver: no reconnection is attempted.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::TestConfig;
use crate::error::HarnessError;
use crate::state::DriverShared;
use crate::timing::POLL_INTERVAL;
use crate::transport;

/// Polls (seconds) before a single-token wait times out fatally.
pub const SINGLE_WAIT_POLLS: u32 = 240;

/// Polls (seconds) before a dual-token wait returns a neutral no-match.
pub const DUAL_WAIT_POLLS: u32 = 120;

/// Token that unconditionally stops the driver, bypassing any pending wait.
pub const STOP_TOKEN: &str = "stop";

/// Outcome of a dual-token wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMatch {
    First,
    Second,
    /// Timed out or stopping; the caller decides whether to retry.
    Neither,
}

#[derive(Debug, Default)]
struct Pending {
    first: Option<String>,
    second: Option<String>,
}

/// Token-wait state shared between the listener task and the driver.
///
/// At most one wait is armed at a time. A control message arriving while no
/// matching wait is armed is dropped; a token racing ahead of its wait
/// registration is therefore lost and must be recovered by the caller's
/// retry loop. The `stop` token is the one exception and always takes
/// effect.
#[derive(Debug)]
pub struct ControlState {
    shared: Arc<DriverShared>,
    found: AtomicU8,
    pending: Mutex<Pending>,
}

impl ControlState {
    #[must_use]
    pub fn new(shared: Arc<DriverShared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            found: AtomicU8::new(0),
            pending: Mutex::new(Pending::default()),
        })
    }

    /// Routes one arriving control message.
    pub fn observe(&self, payload: &str) {
        debug!("control message arrived: {payload:?}");

        if payload == STOP_TOKEN {
            info!("stop requested by orchestrator");
            self.shared.stop();
            return;
        }

        let mut pending = self.pending.lock().expect("pending poisoned");
        if pending.first.as_deref() == Some(payload) {
            pending.first = None;
            self.found.store(1, Ordering::SeqCst);
        } else if pending.second.as_deref() == Some(payload) {
            pending.second = None;
            self.found.store(2, Ordering::SeqCst);
        }
    }

    pub fn arm_single(&self, token: &str) {
        let mut pending = self.pending.lock().expect("pending poisoned");
        pending.first = Some(token.to_string());
        pending.second = None;
        self.found.store(0, Ordering::SeqCst);
    }

    pub fn arm_pair(&self, first: &str, second: &str) {
        let mut pending = self.pending.lock().expect("pending poisoned");
        pending.first = Some(first.to_string());
        pending.second = Some(second.to_string());
        self.found.store(0, Ordering::SeqCst);
    }

    /// Blocks until the armed token is observed.
    ///
    /// Stopping aborts with [`HarnessError::Stopped`]; exhausting the poll
    /// budget sets the stop flag and aborts with
    /// [`HarnessError::ControlTimeout`].
    pub async fn wait_armed_single(&self, token: &str) -> Result<(), HarnessError> {
        let mut count = 0u32;
        while self.found.load(Ordering::SeqCst) == 0 {
            if self.shared.is_stopping() {
                return Err(HarnessError::Stopped);
            }
            count += 1;
            if count == SINGLE_WAIT_POLLS {
                self.shared.stop();
                warn!("failed to receive control message {token:?} - stopping");
                return Err(HarnessError::ControlTimeout(token.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Blocks until either armed token is observed, or the poll budget runs
    /// out. Timing out here is neutral: the stop flag is left untouched.
    pub async fn wait_armed_pair(&self) -> TokenMatch {
        let mut count = 0u32;
        loop {
            match self.found.load(Ordering::SeqCst) {
                1 => return TokenMatch::First,
                2 => return TokenMatch::Second,
                _ => {
                    count += 1;
                    if count == DUAL_WAIT_POLLS || self.shared.is_stopping() {
                        return TokenMatch::Neither;
                    }
                    sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// The driver's connection to the orchestrator.
pub struct ControlChannel {
    client: AsyncClient,
    state: Arc<ControlState>,
    client_id: String,
    send_topic: String,
    listener: JoinHandle<()>,
}

impl ControlChannel {
    /// Connects to the control broker and subscribes to the orchestrator's
    /// outbound topic. Fails fatally if the connection cannot be
    /// established.
    pub async fn connect(
        config: &TestConfig,
        client_id: &str,
        shared: Arc<DriverShared>,
    ) -> Result<Self, HarnessError> {
        let (client, mut eventloop) = transport::connect_pair(
            &config.control_connection,
            client_id,
            true,
            config.username.as_deref(),
            config.password.as_deref(),
        );

        client
            .subscribe(format!("{}/send", config.control_topic), QoS::AtLeastOnce)
            .await?;

        transport::await_connack(&mut eventloop).await?;
        transport::await_suback(&mut eventloop, |_| {}).await?;
        debug!("control channel connected to {}", config.control_connection);

        let state = ControlState::new(shared.clone());
        let listener = tokio::spawn(listen(eventloop, state.clone(), shared));

        Ok(Self {
            client,
            state,
            client_id: client_id.to_string(),
            send_topic: format!("{}/receive", config.control_topic),
            listener,
        })
    }

    /// Publishes `"{client_id}: {msg}"` to the orchestrator at QoS 1,
    /// non-retained. Failures are logged, not retried: the caller does not
    /// depend on delivery confirmation for liveness.
    pub async fn send(&self, msg: &str) {
        let full = format!("{}: {}", self.client_id, msg);
        info!("sending control message {full:?}");
        if let Err(e) = self
            .client
            .publish(&self.send_topic, QoS::AtLeastOnce, false, full.into_bytes())
            .await
        {
            warn!("failed to send control message: {e}");
        }
    }

    /// Waits for a single token, announcing the wait to the orchestrator.
    /// Fatal on timeout (240s).
    pub async fn wait_for(&self, token: &str) -> Result<(), HarnessError> {
        self.state.arm_single(token);
        self.send(&format!("waiting for: {token}")).await;
        self.state.wait_armed_single(token).await
    }

    /// Sends a message and waits for one of two tokens in reply. The wait is
    /// armed before the send so a fast reply cannot slip past it. Neutral on
    /// timeout (120s); the caller loops and retries its handshake.
    pub async fn send_and_wait_for_either(
        &self,
        msg: &str,
        first: &str,
        second: &str,
    ) -> TokenMatch {
        self.state.arm_pair(first, second);
        self.send(msg).await;
        self.state.wait_armed_pair().await
    }

    /// Disconnects and tears down the listener.
    pub async fn finish(self) {
        let _ = self.client.disconnect().await;
        self.listener.abort();
    }
}

async fn listen(mut eventloop: EventLoop, state: Arc<ControlState>, shared: Arc<DriverShared>) {
    loop {
        if shared.is_stopping() {
            break;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload);
                state.observe(&payload);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("control connection lost ({e}) - stopping");
                shared.stop();
                break;
            }
        }
    }
}
