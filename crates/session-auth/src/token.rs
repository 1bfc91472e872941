//! Access token refresh
//!
//! `GET <api base>/Auth/refresh` with the session cookie. The response carries
//! the new token at `data.token`; anything else is a failed refresh.

use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use tracing::debug;

use crate::credentials::Credential;
use crate::endpoints::REFRESH_PATH;
use crate::error::{Error, Result};

/// Boxed future returned by `TokenRefresher::refresh`.
pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>>;

/// Obtains a new credential from outside the bearer channel.
///
/// Uses `Pin<Box<dyn Future>>` so the coordinator can hold `Arc<dyn TokenRefresher>`.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self) -> RefreshFuture<'_>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    data: Option<RefreshData>,
}

#[derive(Debug, Deserialize)]
struct RefreshData {
    token: Option<String>,
}

/// Refresher backed by the REST refresh endpoint.
pub struct HttpRefresher {
    client: reqwest::Client,
    refresh_url: String,
}

impl HttpRefresher {
    /// `client` must have its cookie store enabled; `api_base` is the derived
    /// REST base (see `endpoints::api_base`).
    pub fn new(client: reqwest::Client, api_base: &str) -> Self {
        Self {
            client,
            refresh_url: format!("{}{REFRESH_PATH}", api_base.trim_end_matches('/')),
        }
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }
}

impl TokenRefresher for HttpRefresher {
    fn refresh(&self) -> RefreshFuture<'_> {
        Box::pin(refresh_token(&self.client, &self.refresh_url))
    }
}

/// Call the refresh endpoint once. Never retried by this layer.
pub async fn refresh_token(client: &reqwest::Client, refresh_url: &str) -> Result<Credential> {
    let response = client
        .get(refresh_url)
        .send()
        .await
        .map_err(|e| Error::Http(format!("refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // Session cookie expired or revoked
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        return Err(Error::Status {
            status: status.as_u16(),
            body,
        });
    }

    let parsed = response
        .json::<RefreshResponse>()
        .await
        .map_err(|e| Error::InvalidResponse(e.to_string()))?;

    let token = parsed
        .data
        .and_then(|d| d.token)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| Error::InvalidResponse("no token in refresh response".into()))?;

    debug!("refresh endpoint issued a new token");
    Ok(Credential::new(token))
}
