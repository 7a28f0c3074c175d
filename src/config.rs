//! Test configuration shared read-only across all driver instances.

use std::fmt;
use std::str::FromStr;

use rumqttc::QoS;

use crate::error::HarnessError;

/// A broker endpoint, parsed from `tcp://host:port`, `mqtt://host:port`, or
/// bare `host:port` (port defaults to 1883).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddr {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s
            .strip_prefix("tcp://")
            .or_else(|| s.strip_prefix("mqtt://"))
            .unwrap_or(s);

        if stripped.is_empty() {
            return Err(HarnessError::Config(format!("empty broker address: {s:?}")));
        }

        match stripped.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    HarnessError::Config(format!("invalid port in broker address {s:?}"))
                })?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(Self {
                host: stripped.to_string(),
                port: 1883,
            }),
        }
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses a QoS level from its numeric form.
pub fn parse_qos(s: &str) -> Result<QoS, String> {
    match s {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        _ => Err(format!("QoS must be 0, 1, or 2, got: {s}")),
    }
}

/// Immutable test configuration, shared as `Arc<TestConfig>` across drivers.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Broker under test.
    pub connection: BrokerAddr,
    /// Orchestrator (control) broker.
    pub control_connection: BrokerAddr,
    /// Base name for per-driver data topics.
    pub topic: String,
    /// Base name for the control topic pair (`/send`, `/receive`).
    pub control_topic: String,
    /// Prefix for per-driver client ids.
    pub client_id_prefix: String,
    /// Slot number distinguishing parallel harness processes.
    pub slot_no: u32,
    /// QoS level for all workload traffic; fixed for the process lifetime.
    pub qos: QoS,
    /// Retained flag for workload publishes; fixed for the process lifetime.
    pub retained: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Number of parallel driver instances.
    pub threads: u32,
    /// Prioritized failover address list; replaces `connection` when non-empty.
    pub ha_connections: Vec<BrokerAddr>,
    /// Messages published during the calibration phase.
    pub calibration_sample: u32,
    /// Target wall-clock length of a run phase, in seconds.
    pub window_secs: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            connection: "tcp://localhost:1884".parse().expect("valid default"),
            control_connection: "tcp://localhost:7777".parse().expect("valid default"),
            topic: "XR9TT3".to_string(),
            control_topic: "XR9TT3/control".to_string(),
            client_id_prefix: "XR9TT3_rust".to_string(),
            slot_no: 1,
            qos: QoS::ExactlyOnce,
            retained: false,
            username: None,
            password: None,
            threads: 1,
            ha_connections: Vec::new(),
            calibration_sample: 100,
            window_secs: 30,
        }
    }
}

impl TestConfig {
    /// Data topic for the driver with the given index.
    #[must_use]
    pub fn data_topic(&self, index: u32) -> String {
        format!("{}_{}_{}", self.topic, self.slot_no, index)
    }

    /// Client id for the driver with the given index (used on both the
    /// control broker and the broker under test).
    #[must_use]
    pub fn client_id(&self, index: u32) -> String {
        format!("{}_{}_{}", self.client_id_prefix, self.slot_no, index)
    }

    /// Addresses to try for the workload connection, in priority order.
    #[must_use]
    pub fn workload_addresses(&self) -> &[BrokerAddr] {
        if self.ha_connections.is_empty() {
            std::slice::from_ref(&self.connection)
        } else {
            &self.ha_connections
        }
    }

    /// Parses a space-separated failover list, e.g.
    /// `"tcp://a:1883 tcp://b:1883"`.
    pub fn parse_ha_list(list: &str) -> Result<Vec<BrokerAddr>, HarnessError> {
        list.split_whitespace().map(BrokerAddr::from_str).collect()
    }

    #[must_use]
    pub fn with_connection(mut self, addr: BrokerAddr) -> Self {
        self.connection = addr;
        self
    }

    #[must_use]
    pub fn with_control_connection(mut self, addr: BrokerAddr) -> Self {
        self.control_connection = addr;
        self
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn with_calibration_sample(mut self, sample: u32) -> Self {
        self.calibration_sample = sample;
        self
    }

    #[must_use]
    pub fn with_window_secs(mut self, secs: u64) -> Self {
        self.window_secs = secs;
        self
    }
}
