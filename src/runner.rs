//! Spawns the configured number of driver instances and waits for them all.
//!
//! Drivers are fully isolated from one another (own connections, own data
//! topic, own counters); one driver aborting does not take the others down.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::TestConfig;
use crate::driver::Driver;

/// Runs drivers `1..=threads` to completion.
///
/// Returns an error if any driver aborted; iteration verdicts are reported
/// over the control channel and logged, not turned into process errors.
pub async fn run_all(config: Arc<TestConfig>) -> anyhow::Result<()> {
    let mut handles = Vec::with_capacity(config.threads as usize);
    for index in 1..=config.threads {
        info!("starting driver {index} of {}", config.threads);
        let driver = Driver::new(config.clone(), index);
        handles.push((index, tokio::spawn(driver.run())));
    }

    let mut aborted = 0;
    for (index, handle) in handles {
        match handle.await {
            Ok(Ok(summary)) => info!(
                "driver {index} done: {} iterations, {} failed",
                summary.iterations, summary.failures
            ),
            Ok(Err(e)) => {
                error!("driver {index} aborted: {e}");
                aborted += 1;
            }
            Err(e) => {
                error!("driver {index} task failed: {e}");
                aborted += 1;
            }
        }
    }

    if aborted > 0 {
        anyhow::bail!("{aborted} driver(s) aborted");
    }
    Ok(())
}
