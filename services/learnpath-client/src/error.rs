//! Access layer errors
//!
//! Every failure carries a kind the UI can branch on and a readable message.

use std::fmt;

use thiserror::Error;

/// Failure class reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 401 persisted after the one refresh-and-retry
    AuthExpired,
    /// The refresh itself failed; sign in again
    AuthFailed,
    /// Non-auth HTTP failure, or the server could not be reached
    RequestFailed,
    CorrelationTimeout,
    CorrelationError,
    ChannelUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::RequestFailed => "request_failed",
            ErrorKind::CorrelationTimeout => "correlation_timeout",
            ErrorKind::CorrelationError => "correlation_error",
            ErrorKind::ChannelUnavailable => "channel_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),

    #[error(transparent)]
    Realtime(#[from] realtime::Error),

    #[error(transparent)]
    Config(#[from] common::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(e) => match e {
                transport::Error::AuthExpired { .. } => ErrorKind::AuthExpired,
                transport::Error::AuthFailed { .. } => ErrorKind::AuthFailed,
                transport::Error::RequestFailed { .. } | transport::Error::Http(_) => {
                    ErrorKind::RequestFailed
                }
                transport::Error::Decode(_) => ErrorKind::Internal,
            },
            Error::Realtime(e) => match e {
                realtime::Error::CorrelationTimeout { .. } => ErrorKind::CorrelationTimeout,
                realtime::Error::CorrelationError(_) => ErrorKind::CorrelationError,
                realtime::Error::ChannelUnavailable(_) => ErrorKind::ChannelUnavailable,
                realtime::Error::Protocol(_) => ErrorKind::Internal,
            },
            Error::Config(_) | Error::HttpClient(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status behind the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Transport(e) => e.status(),
            _ => None,
        }
    }
}

/// Result alias using the access layer Error
pub type Result<T> = std::result::Result<T, Error>;
