//! Error types for credential refresh

/// Errors from the refresh endpoint.
///
/// `Clone` because one refresh outcome is fanned out to every queued caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("refresh endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("refresh abandoned before completion")]
    Abandoned,
}

/// Result alias for refresh operations.
pub type Result<T> = std::result::Result<T, Error>;
