//! # MQTT Broker Restart Test Client
//!
//! A soak/correctness test client for validating an MQTT broker's behavior
//! across broker restarts and connection loss. It drives sustained
//! publish/subscribe traffic against the broker under test while coordinating
//! with a separate test-orchestrator process over a parallel "control" MQTT
//! connection.
//!
//! Each driver owns two connections:
//! - a **control channel** to the orchestrator, used purely for handshake
//!   tokens (`Ready`, `start_measuring`, `start_test`, `stop`, ...) and for
//!   reporting per-iteration pass/fail verdicts;
//! - a **workload client** to the broker under test, which publishes
//!   sequentially numbered messages to its own topic and validates the echoes
//!   for ordering and QoS correctness while surviving broker restarts.
//!
//! An iteration calibrates throughput with a fixed message sample, derives a
//! message count targeting a 30-second run window, executes the run, drains
//! trailing deliveries, and reports `verdict: pass` or `verdict: fail` over
//! the control channel. The [`runner`] spawns a configured number of fully
//! isolated drivers in parallel.
//!
//! ```text
//! Runner ── spawns ──> Driver 1..N
//!                        ├─ ControlChannel (orchestrator broker)
//!                        └─ WorkloadClient (broker under test)
//! ```

pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod runner;
pub mod state;
pub mod timing;
pub mod transport;
pub mod workload;

pub use config::{BrokerAddr, TestConfig};
pub use driver::Driver;
pub use error::HarnessError;

/// Initializes tracing with a sensible default filter.
///
/// `verbose` lifts the level to `debug`, `debug` to `trace`. `RUST_LOG`
/// overrides both when set. Safe to call more than once (later calls no-op).
pub fn init_basic_tracing(verbose: bool, debug: bool) {
    let default_level = if debug {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
