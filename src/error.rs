//! Error types of the clustering engine.

use thiserror::Error;

use crate::comm::CommError;

/// An error surfaced by a clustering run.
///
/// All errors are fatal to the run; the message-passing substrate is
/// assumed reliable and nothing is retried.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Invalid parameters, reported before the first collective.
    #[error("invalid configuration: {reason}")]
    Configuration {
        /// What was wrong.
        reason: String,
    },
    /// No fresh message tag is available; the tag range is too small for
    /// the run size.
    #[error("message tag pool exhausted after {claimed} tags (pool size {pool_size})")]
    TagPoolExhausted {
        /// Tags handed out before exhaustion.
        claimed: i32,
        /// Size of this rank's tag pool.
        pool_size: i32,
    },
    /// The transport reported a failure.
    #[error(transparent)]
    Communicator(#[from] CommError),
    /// An internal consistency check failed.
    #[error("invariant violated: {context}")]
    InvariantViolation {
        /// Diagnostic context.
        context: String,
    },
}

impl ClusterError {
    pub(crate) fn invariant(context: impl Into<String>) -> Self {
        ClusterError::InvariantViolation {
            context: context.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        ClusterError::Configuration {
            reason: reason.into(),
        }
    }
}
