//! REST client with credential attachment and refresh-and-retry
//!
//! A protected call that returns 401 hands off to the `RefreshCoordinator`,
//! then replays once with the credential it returns. The replay is marked as
//! a retry, and a retry is never retried again, so a broken token cannot loop.
//! Auth-family endpoints (login, refresh, logout, ...) report their 401
//! directly.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde_json::Value;
use session_auth::{Credential, RefreshCoordinator};
use tracing::{debug, instrument, warn};

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::request::RequestConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

/// Status and raw body of one HTTP exchange.
struct RawResponse {
    status: u16,
    body: String,
}

pub struct TransportClient {
    http: reqwest::Client,
    api_base: String,
    coordinator: Arc<RefreshCoordinator>,
    timeout: Duration,
}

impl TransportClient {
    /// `api_base` is the derived REST base, e.g. `https://host/api`.
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        coordinator: Arc<RefreshCoordinator>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            coordinator,
            timeout,
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Issue `config` and decode the unwrapped payload into `T`.
    pub async fn request<T: DeserializeOwned>(&self, config: RequestConfig) -> Result<T> {
        let value = self.request_value(config).await?;
        serde_json::from_value(value).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Issue `config` and return the unwrapped JSON payload.
    #[instrument(skip_all, fields(method = %config.method, path = %config.path))]
    pub async fn request_value(&self, config: RequestConfig) -> Result<Value> {
        let credential = if config.is_public() {
            None
        } else {
            self.coordinator.store().get()
        };

        let response = self.send(&config, credential.as_ref(), Attempt::First).await?;
        if response.status != 401 || config.skips_refresh() {
            return finish(response);
        }

        // A refresh that settled while this call was in flight already rotated it
        let rotated = self
            .coordinator
            .store()
            .get()
            .filter(|current| !config.is_public() && Some(current) != credential.as_ref());
        let refreshed = match rotated {
            Some(current) => {
                debug!("credential rotated while in flight, replaying without refresh");
                current
            }
            None => {
                debug!("protected call returned 401, refreshing credential");
                self.coordinator
                    .refresh()
                    .await
                    .map_err(|source| Error::AuthFailed {
                        status: response.status,
                        source,
                    })?
            }
        };

        let retry = self.send(&config, Some(&refreshed), Attempt::Retry).await?;
        if retry.status == 401 {
            warn!("replayed call still unauthorized, giving up");
            return Err(Error::AuthExpired { body: retry.body });
        }
        finish(retry)
    }

    async fn send(
        &self,
        config: &RequestConfig,
        credential: Option<&Credential>,
        attempt: Attempt,
    ) -> Result<RawResponse> {
        let url = format!("{}{}", self.api_base, config.path);
        let mut builder = self
            .http
            .request(config.method.clone(), &url)
            .timeout(self.timeout);

        if !config.query.is_empty() {
            builder = builder.query(&config.query);
        }
        if let Some(body) = &config.body {
            builder = builder.json(body);
        }
        // Public endpoints never see the bearer, even on a replay
        if let Some(credential) = credential.filter(|_| !config.is_public()) {
            builder = builder.header(AUTHORIZATION, credential.bearer());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Http(format!("{} {url}: {e}", config.method)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading response body: {e}")))?;

        debug!(status, ?attempt, "response received");
        Ok(RawResponse { status, body })
    }
}

/// Map a final response to the caller's result.
fn finish(response: RawResponse) -> Result<Value> {
    if !(200..300).contains(&response.status) {
        return Err(Error::RequestFailed {
            status: response.status,
            body: response.body,
        });
    }
    Ok(Envelope::detect(parse_body(&response.body)).into_inner())
}

/// Empty bodies decode as `null`; non-JSON bodies become a JSON string.
fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}
