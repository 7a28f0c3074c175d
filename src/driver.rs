//! One driver instance: the iteration state machine that calibrates,
//! publishes a timed workload, drains it back, and reports a verdict to the
//! orchestrator.
//!
//! Iterations repeat until the orchestrator sends `stop` (or a control wait
//! times out fatally). The broker under test is expected to be killed and
//! restarted at arbitrary points throughout; the verdict checks that the
//! configured QoS level's delivery guarantee held across the restart.

use std::sync::Arc;

use rumqttc::QoS;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::config::TestConfig;
use crate::control::{ControlChannel, TokenMatch};
use crate::error::HarnessError;
use crate::state::DriverShared;
use crate::timing::{Stopwatch, POLL_INTERVAL};
use crate::workload::WorkloadClient;

/// One-second polls granted for the drain phase before the verdict is taken
/// from whatever has arrived.
pub const DRAIN_POLLS: u32 = 120;

/// Settle time between the drain and the verdict, so late duplicates count
/// against the iteration they belong to.
pub const DUPLICATE_WAIT: Duration = Duration::from_secs(10);

/// Target message count for the first iteration, scaled so the run phase
/// lasts roughly `window_secs` at the calibrated round-trip rate.
#[must_use]
pub fn calibrated_target(sample: u32, window_secs: u64, roundtrip_ms: u64) -> u32 {
    (1000 * u64::from(sample) * window_secs / roundtrip_ms.max(1)) as u32
}

/// Target message count for subsequent iterations, scaled from how long the
/// previous iteration actually took.
#[must_use]
pub fn adaptive_target(last_expected: u32, window_secs: u64, last_completion_secs: u64) -> u32 {
    (u64::from(last_expected) * window_secs / last_completion_secs.max(1)) as u32
}

/// Pass/fail for one iteration.
///
/// Any validation error fails outright. Otherwise an exact count passes at
/// every QoS; a mismatch passes at QoS 0 (loss is legal), passes at QoS 1
/// only when extra deliveries pushed the count over (duplicates are legal),
/// and always fails at QoS 2.
#[must_use]
pub fn verdict(qos: QoS, arrived: u32, expected: u32, errors: u32) -> bool {
    if errors != 0 {
        return false;
    }
    if arrived == expected {
        return true;
    }
    match qos {
        QoS::AtMostOnce => true,
        QoS::AtLeastOnce => arrived > expected,
        QoS::ExactlyOnce => false,
    }
}

/// Outcome of a completed driver run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverSummary {
    pub iterations: u32,
    pub failures: u32,
}

/// A single isolated test driver with its own control and workload
/// connections, data topic, and counters.
pub struct Driver {
    config: Arc<TestConfig>,
    index: u32,
    shared: Arc<DriverShared>,
    last_expected: u32,
    last_completion_secs: u64,
    summary: DriverSummary,
}

impl Driver {
    #[must_use]
    pub fn new(config: Arc<TestConfig>, index: u32) -> Self {
        Self {
            config,
            index,
            shared: Arc::new(DriverShared::new()),
            last_expected: 0,
            last_completion_secs: 0,
            summary: DriverSummary::default(),
        }
    }

    /// Connects both channels, performs the readiness handshake, then runs
    /// iterations until stopped.
    pub async fn run(mut self) -> Result<DriverSummary, HarnessError> {
        let client_id = self.config.client_id(self.index);
        let control_id = format!("{client_id}_control");

        let control =
            ControlChannel::connect(&self.config, &control_id, self.shared.clone()).await?;
        if let Err(e) = control.wait_for("who is ready?").await {
            control.finish().await;
            return match e {
                HarnessError::Stopped => Ok(self.summary),
                e => Err(e),
            };
        }

        let workload =
            match WorkloadClient::connect(&self.config, self.index, self.shared.clone()).await {
                Ok(workload) => workload,
                Err(e) => {
                    control.finish().await;
                    return Err(e);
                }
            };

        // The orchestrator may re-poll readiness while other drivers come
        // up; answer until it releases us.
        loop {
            if self.shared.is_stopping() {
                return self.teardown(control, workload).await;
            }
            let matched = control
                .send_and_wait_for_either("Ready", "who is ready?", "continue")
                .await;
            if matched == TokenMatch::Second {
                break;
            }
        }

        while !self.shared.is_stopping() {
            match self.one_iteration(&control, &workload).await {
                Ok(passed) => {
                    self.summary.iterations += 1;
                    if !passed {
                        self.summary.failures += 1;
                    }
                }
                Err(HarnessError::Stopped) => break,
                Err(e) => {
                    self.shared.stop();
                    let _ = self.teardown(control, workload).await;
                    return Err(e);
                }
            }
        }

        self.teardown(control, workload).await
    }

    async fn teardown(
        self,
        control: ControlChannel,
        workload: WorkloadClient,
    ) -> Result<DriverSummary, HarnessError> {
        info!(
            "driver {} finished: {} iterations, {} failed",
            self.index, self.summary.iterations, self.summary.failures
        );
        workload.finish().await;
        control.finish().await;
        Ok(self.summary)
    }

    async fn one_iteration(
        &mut self,
        control: &ControlChannel,
        workload: &WorkloadClient,
    ) -> Result<bool, HarnessError> {
        let iteration = self.summary.iterations + 1;

        control.wait_for("start_measuring").await?;

        let expected = if self.last_completion_secs == 0 {
            let roundtrip_ms = self.calibrate(workload).await?;
            info!(
                "driver {}: round-trip time for {} messages is {roundtrip_ms}ms",
                self.index, self.config.calibration_sample
            );
            calibrated_target(
                self.config.calibration_sample,
                self.config.window_secs,
                roundtrip_ms,
            )
        } else {
            info!(
                "driver {}: last time, {} messages took {}s",
                self.index, self.last_expected, self.last_completion_secs
            );
            adaptive_target(
                self.last_expected,
                self.config.window_secs,
                self.last_completion_secs,
            )
        };
        info!(
            "driver {}: {expected} messages needed for a {}s run",
            self.index, self.config.window_secs
        );

        control.wait_for("start_test").await?;

        self.shared.reset_arrived();
        info!("driver {}: iteration {iteration}, publishing {expected} messages", self.index);

        let watch = Stopwatch::start();
        for seq in 1..=expected {
            workload.publish_sequenced(seq).await?;
        }
        info!(
            "driver {}: {expected} messages sent in {}s",
            self.index,
            watch.elapsed_secs()
        );

        let completion_secs = self.drain(expected, &watch).await;
        self.last_expected = expected;
        self.last_completion_secs = completion_secs.max(1);

        // Late redeliveries count against the verdict, so give them time to
        // land before taking it.
        sleep(DUPLICATE_WAIT).await;

        let arrived = self.shared.arrived();
        let errors = self.shared.errors();
        let passed = verdict(self.config.qos, arrived, expected, errors);
        info!(
            "driver {}: iteration {iteration} {}: {arrived}/{expected} arrived, \
             {errors} errors, {completion_secs}s",
            self.index,
            if passed { "passed" } else { "FAILED" }
        );
        control
            .send(&format!("verdict: {}", if passed { "pass" } else { "fail" }))
            .await;

        control.wait_for("test finished").await?;
        Ok(passed)
    }

    /// Publishes the calibration sample and waits for it to round-trip,
    /// returning the measured time.
    async fn calibrate(&self, workload: &WorkloadClient) -> Result<u64, HarnessError> {
        self.shared.reset_arrived();
        self.shared.begin_measurement(Instant::now());

        for seq in 1..=self.config.calibration_sample {
            workload.publish_sequenced(seq).await?;
        }

        while self.shared.arrived() < self.config.calibration_sample {
            if self.shared.is_stopping() {
                self.shared.end_measurement();
                return Err(HarnessError::Stopped);
            }
            sleep(POLL_INTERVAL).await;
        }
        self.shared.end_measurement();
        Ok(self.shared.roundtrip_ms().max(1))
    }

    /// Waits for the published messages to arrive back. Gives up after the
    /// drain budget (or when stopping) and leaves the verdict to decide from
    /// the counts.
    async fn drain(&self, expected: u32, watch: &Stopwatch) -> u64 {
        let mut last_report = 0;
        let mut polls = 0;
        while self.shared.arrived() < expected {
            let arrived = self.shared.arrived();
            if arrived > last_report {
                info!(
                    "driver {}: {arrived} of {expected} messages arrived in {}s",
                    self.index,
                    watch.elapsed_secs()
                );
                last_report = arrived;
            }
            sleep(POLL_INTERVAL).await;
            polls += 1;
            if polls > DRAIN_POLLS || self.shared.is_stopping() {
                warn!(
                    "driver {}: drain incomplete, {}/{expected} arrived",
                    self.index,
                    self.shared.arrived()
                );
                break;
            }
        }
        watch.elapsed_secs()
    }
}
