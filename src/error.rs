//! Engine error taxonomy.
//!
//! Engines recover locally from transport and back-pressure failures; only
//! `InvalidTransition` aborts a run. Everything else is logged with phase
//! context and folded into the normal control flow.

use crate::model::{Direction, Phase, StreamId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An in-flight request was aborted because its stream was terminated.
    /// Expected during shutdown; never surfaced.
    #[error("transport cancelled on {direction:?} stream {stream_id}")]
    TransportCancelled {
        stream_id: StreamId,
        direction: Direction,
    },

    /// Connection reset, DNS failure, or any non-cancellation I/O error.
    /// The stream is marked terminated and not restarted.
    #[error("transport failed on {direction:?} stream {stream_id}: {source}")]
    TransportFailed {
        stream_id: StreamId,
        direction: Direction,
        #[source]
        source: reqwest::Error,
    },

    /// 413/429/5xx from the upload sink. Recovered by the back-pressure
    /// protocol; carried here only for logging.
    #[error("server back-pressure: HTTP {status}")]
    ServerBackpressure { status: u16 },

    /// A latency probe attempt exceeded its window.
    #[error("latency probe timed out after {timeout_ms} ms")]
    LatencyTimeout { timeout_ms: u64 },

    /// The phase controller was asked to make an out-of-order transition.
    /// Fatal: the run aborts straight to `Complete`.
    #[error("invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition { from: Option<Phase>, to: Phase },

    /// `terminate_all` left a residual stream past its hard deadline.
    /// Recovered by `emergency_cleanup`; not fatal.
    #[error("{count} stream(s) survived graceful termination")]
    LeakedStream { count: usize },

    /// Rejected at engine construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Cancellation is the one transport outcome that is fully expected and
    /// must not be reported as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::TransportCancelled { .. })
    }

    /// Whether this error aborts the run instead of being absorbed locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::InvalidTransition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, Phase, StreamId};

    #[test]
    fn only_invalid_transition_is_fatal() {
        let e = EngineError::InvalidTransition {
            from: Some(Phase::Complete),
            to: Phase::Download,
        };
        assert!(e.is_fatal());

        let e = EngineError::LeakedStream { count: 2 };
        assert!(!e.is_fatal());

        let e = EngineError::ServerBackpressure { status: 503 };
        assert!(!e.is_fatal());
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        let e = EngineError::TransportCancelled {
            stream_id: StreamId(7),
            direction: Direction::Download,
        };
        assert!(e.is_cancellation());
        assert!(!e.is_fatal());
    }
}
