//! Channel registry
//!
//! Channels are created lazily on first use and shared afterwards. A channel
//! whose initial connection fails is forgotten, so the next caller starts a
//! fresh attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use session_auth::TokenStore;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channel::{Channel, DEFAULT_SERVER_TIMEOUT, supervise};
use crate::connection::ConnectionFactory;
use crate::error::Result;
use crate::state::{BackoffPolicy, ChannelState};

pub struct ChannelManager {
    factory: Arc<dyn ConnectionFactory>,
    tokens: Arc<dyn TokenStore>,
    backoff: BackoffPolicy,
    server_timeout: Duration,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelManager {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        tokens: Arc<dyn TokenStore>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            factory,
            tokens,
            backoff,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Silence after which a connected channel reconnects.
    pub fn with_server_timeout(mut self, server_timeout: Duration) -> Self {
        self.server_timeout = server_timeout;
        self
    }

    /// Channel named `name`, started on first use.
    ///
    /// Concurrent callers share one connection attempt. Returns
    /// `ChannelUnavailable` when the initial connection fails.
    pub async fn get(&self, name: &str) -> Result<Arc<Channel>> {
        let channel = {
            let mut channels = self.channels.lock().await;
            let live = channels
                .get(name)
                .filter(|existing| existing.state() != ChannelState::Disconnected)
                .cloned();
            match live {
                Some(existing) => existing,
                None => {
                    info!(channel = name, "starting channel");
                    let channel = Arc::new(Channel::new(name));
                    tokio::spawn(supervise(
                        channel.clone(),
                        self.factory.clone(),
                        self.tokens.clone(),
                        self.backoff,
                        self.server_timeout,
                    ));
                    channels.insert(name.to_string(), channel.clone());
                    channel
                }
            }
        };

        if let Err(e) = channel.wait_started().await {
            let mut channels = self.channels.lock().await;
            if channels
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, &channel))
            {
                channels.remove(name);
            }
            return Err(e);
        }
        Ok(channel)
    }

    /// Tear down one channel. Its pending calls reject.
    pub async fn disconnect(&self, name: &str) {
        if let Some(channel) = self.channels.lock().await.remove(name) {
            channel.disconnect();
        }
    }

    /// Tear down every channel.
    pub async fn disconnect_all(&self) {
        let channels: Vec<_> = self.channels.lock().await.drain().collect();
        debug!(count = channels.len(), "disconnecting all channels");
        for (_, channel) in channels {
            channel.disconnect();
        }
    }

    /// Names of channels currently tracked.
    pub async fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
