//! Error types for realtime channels and correlated calls

use std::time::Duration;

/// Errors from channel and correlator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no response to {method}({arg_id}) within {}ms", .timeout.as_millis())]
    CorrelationTimeout {
        method: String,
        arg_id: String,
        timeout: Duration,
    },

    #[error("server reported error: {0}")]
    CorrelationError(String),

    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("hub protocol error: {0}")]
    Protocol(String),
}

/// Result alias for realtime operations.
pub type Result<T> = std::result::Result<T, Error>;
