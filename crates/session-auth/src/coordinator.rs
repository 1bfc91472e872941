//! Single-flight credential refresh
//!
//! State machine: `Idle -> Refreshing -> Idle`. The first caller to need a
//! refresh moves the coordinator to `Refreshing` and starts the refresh call;
//! every caller arriving while it is in flight joins the waiter queue instead
//! of issuing its own. Refresh tokens rotate, so two concurrent refreshes
//! would invalidate each other.
//!
//! The refresh runs in a spawned task. Dropping the caller that started it
//! does not strand the queue in `Refreshing`, and neither does a refresher
//! that panics: its queue settles with `Abandoned` and the state returns to
//! `Idle`.
//!
//! All waiters of one `Refreshing` period receive the same outcome. The queue
//! is taken and the state reset to `Idle` under one lock, so a caller arriving
//! afterwards starts a fresh refresh instead of attaching to a settled one.

use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::credentials::{Credential, TokenStore};
use crate::error::{Error, Result};
use crate::token::TokenRefresher;

type Waiter = oneshot::Sender<Result<Credential>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

struct Inner {
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn TokenStore>,
    state: Mutex<RefreshState>,
}

/// Sole writer of the `TokenStore`.
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(refresher: Arc<dyn TokenRefresher>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                refresher,
                store,
                state: Mutex::new(RefreshState::Idle),
            }),
        }
    }

    /// Read-only handle to the store this coordinator writes.
    pub fn store(&self) -> Arc<dyn TokenStore> {
        self.inner.store.clone()
    }

    /// Install a credential obtained from login or OTP verification.
    pub fn install(&self, credential: Credential) {
        info!("session credential installed");
        self.inner.store.set(Some(credential));
    }

    /// Drop the session credential (logout).
    pub fn revoke(&self) {
        info!("session credential revoked");
        self.inner.store.clear();
    }

    /// Whether a refresh is currently in flight.
    pub async fn is_refreshing(&self) -> bool {
        matches!(
            *self.inner.state.lock().await,
            RefreshState::Refreshing { .. }
        )
    }

    /// Obtain a fresh credential, sharing any refresh already in flight.
    ///
    /// On success the new credential is already in the store when this
    /// returns. On failure the store has been cleared; the failure is terminal
    /// for the session and is not retried.
    pub async fn refresh(&self) -> Result<Credential> {
        let (tx, rx) = oneshot::channel();

        let leader = {
            let mut state = self.inner.state.lock().await;
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    waiters.push(tx);
                    debug!(queued = waiters.len(), "refresh in flight, waiting");
                    false
                }
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing { waiters: vec![tx] };
                    true
                }
            }
        };

        if leader {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.run_refresh().await });
        }

        rx.await.unwrap_or(Err(Error::Abandoned))
    }
}

impl Inner {
    async fn run_refresh(&self) {
        info!("refreshing session credential");
        let refresher = self.refresher.clone();
        let outcome = match tokio::spawn(async move { refresher.refresh().await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "refresh task failed");
                Err(Error::Abandoned)
            }
        };

        match &outcome {
            Ok(credential) => self.store.set(Some(credential.clone())),
            Err(e) => {
                warn!(error = %e, "credential refresh failed, clearing session");
                self.store.clear();
            }
        }

        let waiters = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::Refreshing { waiters } => waiters,
                RefreshState::Idle => Vec::new(),
            }
        };

        let label = if outcome.is_ok() { "success" } else { "failure" };
        metrics::counter!("access_refresh_total", "outcome" => label).increment(1);
        metrics::histogram!("access_refresh_waiters").record(waiters.len() as f64);
        info!(outcome = label, waiters = waiters.len(), "credential refresh settled");

        for waiter in waiters {
            // Receiver gone means that caller was cancelled
            let _ = waiter.send(outcome.clone());
        }
    }
}
