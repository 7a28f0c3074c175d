use thiserror::Error;

/// Errors surfaced by the test harness.
///
/// Fatal-to-driver conditions (control loss, control wait timeout, the
/// orchestrator's `stop` token) unwind through these variants; recoverable
/// conditions (workload publish failure, workload connection loss) are
/// retried in place and never reach the caller.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// The fatal single-token control wait timed out (240 one-second polls).
    #[error("timed out waiting for control message {0:?}")]
    ControlTimeout(String),

    /// Cooperative cancellation: the stop flag was observed mid-operation.
    #[error("stop requested")]
    Stopped,

    #[error("client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}
