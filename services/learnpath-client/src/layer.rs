//! Access layer assembly
//!
//! One explicitly constructed `AccessLayer` owns the credential store, the
//! refresh coordinator, the REST transport and the content hubs. Nothing here
//! is global; dropping the layer drops the session.

use std::sync::Arc;

use realtime::{
    ChannelManager, ConnectionFactory, ContentKind, CorrelationPolicy, Correlator, InvokeOptions,
    WebSocketConnector,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use session_auth::{Credential, HttpRefresher, MemoryTokenStore, RefreshCoordinator, TokenStore};
use tracing::{info, warn};
use transport::{RequestConfig, TransportClient};

use crate::config::Config;
use crate::error::{Error, Result};

pub struct AccessLayer {
    coordinator: Arc<RefreshCoordinator>,
    transport: TransportClient,
    channels: Arc<ChannelManager>,
    correlator: Correlator,
}

impl AccessLayer {
    /// Production wiring: cookie-enabled HTTP client and WebSocket hubs.
    pub fn new(config: &Config) -> Result<Self> {
        let connector = WebSocketConnector::new(config.hub_base(), config.keepalive());
        Self::with_connector(config, Arc::new(connector))
    }

    /// Wiring with a caller-supplied hub connection factory.
    pub fn with_connector(config: &Config, connector: Arc<dyn ConnectionFactory>) -> Result<Self> {
        // The refresh call authenticates with the session cookie
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| Error::HttpClient(e.to_string()))?;
        let api_base = config.api_base();

        let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(HttpRefresher::new(http.clone(), &api_base));
        let coordinator = Arc::new(RefreshCoordinator::new(refresher, tokens.clone()));
        if let Some(token) = &config.api.access_token {
            coordinator.install(Credential::from(token.clone()));
        }

        let transport = TransportClient::new(
            http,
            api_base.clone(),
            coordinator.clone(),
            config.request_timeout(),
        );

        let channels = Arc::new(
            ChannelManager::new(connector, tokens, config.backoff())
                .with_server_timeout(config.server_timeout()),
        );
        let policy = config.correlation_policy();
        if policy == CorrelationPolicy::AnyEvent {
            warn!(
                "hub events are matched by channel only; concurrent content requests may \
                 receive each other's replies until realtime.correlation_field is set"
            );
        }
        let correlator = Correlator::new(channels.clone(), policy, config.invoke_timeout());

        info!(
            api_base = %api_base,
            hub_base = %config.hub_base(),
            signed_in = config.api.access_token.is_some(),
            "access layer ready"
        );

        Ok(Self {
            coordinator,
            transport,
            channels,
            correlator,
        })
    }

    /// REST call returning the unwrapped payload decoded into `T`.
    pub async fn request<T: DeserializeOwned>(&self, config: RequestConfig) -> Result<T> {
        Ok(self.transport.request(config).await?)
    }

    /// REST call returning the unwrapped JSON payload.
    pub async fn request_value(&self, config: RequestConfig) -> Result<Value> {
        Ok(self.transport.request_value(config).await?)
    }

    /// Correlated call on a content hub.
    pub async fn invoke_correlated(
        &self,
        channel: &str,
        method: &str,
        arg_id: &str,
        options: InvokeOptions,
    ) -> Result<Value> {
        Ok(self.correlator.invoke(channel, method, arg_id, options).await?)
    }

    /// Generated lesson or chapter content.
    pub async fn request_content(&self, kind: ContentKind, id: &str) -> Result<Value> {
        Ok(self.correlator.request_content(kind, id).await?)
    }

    /// Start a session with a token obtained from login.
    pub fn sign_in(&self, token: impl Into<String>) {
        self.coordinator.install(Credential::new(token));
    }

    /// End the session. Hub connections authenticated with the old token are
    /// torn down and their pending calls rejected.
    pub async fn sign_out(&self) {
        self.coordinator.revoke();
        self.channels.disconnect_all().await;
    }

    pub fn is_signed_in(&self) -> bool {
        self.coordinator.store().get().is_some()
    }

    /// Close every hub connection. The session credential is kept.
    pub async fn shutdown(&self) {
        info!("shutting down access layer");
        self.channels.disconnect_all().await;
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }
}
