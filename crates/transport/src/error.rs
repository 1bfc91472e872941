//! Transport error types

/// Errors surfaced by `TransportClient`.
///
/// A 401 recovered by refresh-and-retry never reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 401 that persisted after the single refresh-and-retry.
    #[error("session expired: {body}")]
    AuthExpired { body: String },

    /// The refresh triggered by a 401 failed. The session credential has been
    /// cleared; the caller must sign in again.
    #[error("request returned {status} and session refresh failed: {source}")]
    AuthFailed {
        status: u16,
        #[source]
        source: session_auth::Error,
    },

    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl Error {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::AuthExpired { .. } => Some(401),
            Error::AuthFailed { status, .. } | Error::RequestFailed { status, .. } => Some(*status),
            Error::Http(_) | Error::Decode(_) => None,
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_exposed_for_http_failures() {
        let err = Error::RequestFailed {
            status: 404,
            body: "missing".into(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(
            Error::AuthExpired {
                body: String::new()
            }
            .status(),
            Some(401)
        );
        assert_eq!(Error::Http("refused".into()).status(), None);
    }

    #[test]
    fn auth_failed_keeps_refresh_error_as_source() {
        let err = Error::AuthFailed {
            status: 401,
            source: session_auth::Error::Rejected {
                status: 401,
                body: "expired".into(),
            },
        };
        assert!(err.to_string().contains("refresh failed"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("expired"));
    }
}
