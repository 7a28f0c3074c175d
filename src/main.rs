use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rumqttc::QoS;

use mqtt_restart_test::config::{parse_qos, TestConfig};
use mqtt_restart_test::{init_basic_tracing, runner};

/// Long-running broker restart test client.
///
/// Connects to an orchestrator over a control broker, then exercises the
/// broker under test with a sequenced message workload while the
/// orchestrator kills and restarts it, verifying that the configured QoS
/// level's delivery guarantee holds across restarts.
#[derive(Parser, Debug)]
#[command(name = "restart-test", version)]
struct Args {
    /// Broker under test, e.g. tcp://localhost:1884
    #[arg(long, default_value = "tcp://localhost:1884")]
    connection: String,

    /// Control (orchestrator) broker
    #[arg(long, default_value = "tcp://localhost:7777")]
    control_connection: String,

    /// Base name for per-driver data topics
    #[arg(long, default_value = "XR9TT3")]
    topic: String,

    /// Base name for the control topic pair
    #[arg(long, default_value = "XR9TT3/control")]
    control_topic: String,

    /// Prefix for per-driver client ids
    #[arg(long, default_value = "XR9TT3_rust")]
    client_id: String,

    /// Slot number distinguishing parallel harness processes
    #[arg(long, default_value_t = 1)]
    slot_no: u32,

    /// QoS level for all workload traffic (0, 1, or 2)
    #[arg(long, default_value = "2", value_parser = parse_qos)]
    qos: QoS,

    /// Publish workload messages with the retained flag set
    #[arg(long)]
    retained: bool,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Number of parallel driver instances
    #[arg(long, default_value_t = 1)]
    threads: u32,

    /// Space-separated failover address list for the broker under test,
    /// tried in priority order; overrides --connection
    #[arg(long)]
    ha_connection: Option<String>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Trace-level logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_basic_tracing(args.verbose, args.debug);

    let config = TestConfig {
        connection: args.connection.parse().context("invalid --connection")?,
        control_connection: args
            .control_connection
            .parse()
            .context("invalid --control-connection")?,
        topic: args.topic,
        control_topic: args.control_topic,
        client_id_prefix: args.client_id,
        slot_no: args.slot_no,
        qos: args.qos,
        retained: args.retained,
        username: args.username,
        password: args.password,
        threads: args.threads,
        ha_connections: match args.ha_connection {
            Some(list) => TestConfig::parse_ha_list(&list).context("invalid --ha-connection")?,
            None => Vec::new(),
        },
        ..TestConfig::default()
    };

    runner::run_all(Arc::new(config)).await
}
