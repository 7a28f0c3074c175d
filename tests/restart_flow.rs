//! End-to-end flow against an in-process rumqttd broker.
//!
//! A scripted orchestrator drives a single driver through the readiness
//! handshake and one full iteration (calibrate, run, drain, verdict), then
//! stops it. One broker plays both the control and the workload role.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use rumqttd::{Config, ConnectionSettings, RouterConfig, ServerSettings};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use mqtt_restart_test::state::DriverShared;
use mqtt_restart_test::workload::WorkloadClient;
use mqtt_restart_test::{Driver, TestConfig};

fn next_port() -> u16 {
    static PORT: AtomicU16 = AtomicU16::new(18830);
    PORT.fetch_add(1, Ordering::SeqCst)
}

fn broker_config(listen: SocketAddr) -> Config {
    let mut servers = HashMap::new();
    servers.insert(
        "tcp".to_string(),
        ServerSettings {
            name: "tcp".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 60000,
                max_payload_size: 1024 * 1024,
                max_inflight_count: 100,
                auth: None,
                external_auth: None,
                dynamic_filters: false,
            },
        },
    );

    Config {
        id: 0,
        router: RouterConfig {
            max_connections: 1000,
            max_outgoing_packet_count: 200,
            max_segment_size: 1024 * 1024,
            max_segment_count: 10,
            ..Default::default()
        },
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        console: None,
        bridge: None,
        cluster: None,
    }
}

/// Starts a broker on a fresh port and returns its address string.
async fn start_broker() -> String {
    let port = next_port();
    let listen: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let mut broker = rumqttd::Broker::new(broker_config(listen));
    std::thread::spawn(move || {
        broker.start().unwrap();
    });
    sleep(Duration::from_millis(200)).await;
    format!("tcp://127.0.0.1:{port}")
}

/// TCP relay in front of the broker. Sending on the returned channel severs
/// every live relayed connection, forcing clients through their reconnect
/// path; new connections pass through again afterwards.
async fn start_relay(upstream: &str) -> (String, mpsc::UnboundedSender<()>) {
    let upstream = upstream.strip_prefix("tcp://").unwrap().to_string();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        let mut links: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((mut inbound, _)) = accepted else { break };
                    let upstream = upstream.clone();
                    links.push(tokio::spawn(async move {
                        if let Ok(mut outbound) = TcpStream::connect(&upstream).await {
                            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
                                .await;
                        }
                    }));
                }
                signal = kill_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    for link in links.drain(..) {
                        link.abort();
                    }
                }
            }
        }
    });

    (format!("tcp://127.0.0.1:{port}"), kill_tx)
}

/// The orchestrator half of the control protocol: reads driver messages from
/// `{control_topic}/receive` and publishes bare tokens to
/// `{control_topic}/send`.
struct Orchestrator {
    client: AsyncClient,
    incoming: mpsc::UnboundedReceiver<String>,
    send_topic: String,
}

impl Orchestrator {
    async fn connect(addr: &str, control_topic: &str) -> Self {
        let (host, port) = addr
            .strip_prefix("tcp://")
            .unwrap()
            .rsplit_once(':')
            .unwrap();
        let mut options = MqttOptions::new("orchestrator", host, port.parse::<u16>().unwrap());
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        client
            .subscribe(format!("{control_topic}/receive"), QoS::AtLeastOnce)
            .await
            .unwrap();

        let (tx, incoming) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let _ = tx.send(String::from_utf8_lossy(&publish.payload).into_owned());
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        let orchestrator = Self {
            client,
            incoming,
            send_topic: format!("{control_topic}/send"),
        };
        // Give the subscription time to land before the driver starts
        // talking.
        sleep(Duration::from_millis(300)).await;
        orchestrator
    }

    async fn send(&self, token: &str) {
        self.client
            .publish(&self.send_topic, QoS::AtLeastOnce, false, token)
            .await
            .unwrap();
    }

    /// Discards driver messages until one contains `needle`.
    async fn expect(&mut self, needle: &str) -> String {
        timeout(Duration::from_secs(60), async {
            loop {
                let msg = self.incoming.recv().await.expect("control stream closed");
                if msg.contains(needle) {
                    return msg;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for control message containing {needle:?}"))
    }
}

fn test_config(addr: &str) -> TestConfig {
    TestConfig::default()
        .with_connection(addr.parse().unwrap())
        .with_control_connection(addr.parse().unwrap())
        .with_calibration_sample(5)
        .with_window_secs(1)
}

#[tokio::test]
async fn full_iteration_passes_against_live_broker() {
    let addr = start_broker().await;
    let config = Arc::new(test_config(&addr));
    let mut orchestrator = Orchestrator::connect(&addr, &config.control_topic).await;

    let driver = tokio::spawn(Driver::new(config, 1).run());

    orchestrator.expect("waiting for: who is ready?").await;
    orchestrator.send("who is ready?").await;

    orchestrator.expect("Ready").await;
    orchestrator.send("continue").await;

    orchestrator.expect("waiting for: start_measuring").await;
    orchestrator.send("start_measuring").await;

    orchestrator.expect("waiting for: start_test").await;
    orchestrator.send("start_test").await;

    orchestrator.expect("verdict: pass").await;
    orchestrator.expect("waiting for: test finished").await;
    orchestrator.send("test finished").await;

    // The next iteration starts by asking to measure again; stop it there.
    orchestrator.expect("waiting for: start_measuring").await;
    orchestrator.send("stop").await;

    let summary = timeout(Duration::from_secs(60), driver)
        .await
        .expect("driver did not stop")
        .expect("driver task panicked")
        .expect("driver aborted");
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.failures, 0);
}

async fn wait_for_arrivals(shared: &DriverShared, at_least: u32) {
    timeout(Duration::from_secs(30), async {
        while shared.arrived() < at_least {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!("only {} messages arrived, wanted {at_least}", shared.arrived())
    });
}

#[tokio::test]
async fn workload_recovers_after_connection_loss() {
    let broker = start_broker().await;
    let (relay, kill) = start_relay(&broker).await;
    let config = Arc::new(
        test_config(&broker)
            .with_connection(relay.parse().unwrap())
            .with_qos(QoS::AtLeastOnce),
    );
    let shared = Arc::new(DriverShared::new());
    let workload = WorkloadClient::connect(&config, 1, shared.clone())
        .await
        .unwrap();

    for seq in 1..=10 {
        workload.publish_sequenced(seq).await.unwrap();
    }
    wait_for_arrivals(&shared, 10).await;

    // Sever the live connection, then give the client time to run its
    // reconnect delay and re-establish through a fresh relay link.
    kill.send(()).unwrap();
    sleep(Duration::from_secs(8)).await;

    for seq in 11..=20 {
        workload.publish_sequenced(seq).await.unwrap();
    }
    wait_for_arrivals(&shared, 20).await;

    workload.finish().await;
}

#[tokio::test]
async fn workload_connect_failure_aborts_driver() {
    let broker = start_broker().await;
    // A port from the allocator that nothing listens on.
    let dead = format!("tcp://127.0.0.1:{}", next_port());
    let config = Arc::new(test_config(&broker).with_connection(dead.parse().unwrap()));
    let mut orchestrator = Orchestrator::connect(&broker, &config.control_topic).await;

    let driver = tokio::spawn(Driver::new(config, 1).run());

    orchestrator.expect("waiting for: who is ready?").await;
    orchestrator.send("who is ready?").await;

    let result = timeout(Duration::from_secs(60), driver)
        .await
        .expect("driver hung")
        .expect("driver task panicked");
    assert!(result.is_err());
}

#[tokio::test]
async fn stop_during_initial_wait_exits_cleanly() {
    let addr = start_broker().await;
    let config = Arc::new(test_config(&addr));
    let mut orchestrator = Orchestrator::connect(&addr, &config.control_topic).await;

    let driver = tokio::spawn(Driver::new(config, 1).run());

    orchestrator.expect("waiting for: who is ready?").await;
    orchestrator.send("stop").await;

    let summary = timeout(Duration::from_secs(30), driver)
        .await
        .expect("driver did not stop")
        .expect("driver task panicked")
        .expect("driver aborted");
    assert_eq!(summary.iterations, 0);
}
