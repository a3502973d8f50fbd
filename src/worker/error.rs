//! Transport errors

use thiserror::Error;

/// Failures seen by a caller waiting on the worker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The compute side failed the request; details were logged there
    #[error("request rejected")]
    Rejected,

    /// The worker was forcefully terminated while the request was pending
    #[error("worker forcefully terminated")]
    Terminated,

    /// The compute thread is gone
    #[error("worker disconnected")]
    Disconnected,

    /// The compute thread could not be started
    #[error("failed to spawn worker: {reason}")]
    Spawn { reason: String },
}
