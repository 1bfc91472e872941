//! Supervised duplex channel
//!
//! A `Channel` outlives its physical connections. Server broadcasts and
//! invocation completions are fanned out on a broadcast queue; each listener
//! is one subscription, and dropping the subscription detaches it. The
//! supervisor task owns the connection and drives `state::handle_event`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use session_auth::TokenStore;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use crate::protocol::HubMessage;
use crate::state::{BackoffPolicy, ChannelAction, ChannelEvent, ChannelState, handle_event};

/// Broadcast queue depth per channel. A listener lagging further behind than
/// this misses events, including `<X>Loading` progress; terminal events for a
/// lagging call may be lost too, in which case it settles by its deadline.
const EVENT_BUFFER: usize = 256;

/// Silence after which an open connection is treated as dropped. Twice the
/// default keepalive, so one missed server ping is tolerated.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-originated message as seen by listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Broadcast {
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        error: Option<String>,
    },
}

#[derive(Debug)]
pub struct Channel {
    name: String,
    events: broadcast::Sender<HubEvent>,
    outgoing: Mutex<Option<mpsc::Sender<HubMessage>>>,
    state: watch::Sender<ChannelState>,
    shutdown: watch::Sender<bool>,
    last_error: Mutex<Option<String>>,
    next_invocation: AtomicU64,
}

impl Channel {
    /// New channel already in its initial `Connecting` state.
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(ChannelState::Connecting { attempt: 0 });
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            events,
            outgoing: Mutex::new(None),
            state,
            shutdown,
            last_error: Mutex::new(None),
            next_invocation: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Register a listener for every server event on this channel.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Send an invocation of `method`. Returns its invocation id.
    pub async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<String> {
        let sender = lock(&self.outgoing).clone().ok_or_else(|| {
            Error::ChannelUnavailable(format!(
                "{} channel is {}",
                self.name,
                self.state().label()
            ))
        })?;

        let invocation_id = self.next_invocation.fetch_add(1, Ordering::Relaxed).to_string();
        sender
            .send(HubMessage::Invocation {
                invocation_id: Some(invocation_id.clone()),
                target: method.to_string(),
                arguments,
            })
            .await
            .map_err(|_| Error::ChannelUnavailable(format!("{} connection closed", self.name)))?;

        debug!(channel = %self.name, method, invocation_id, "invocation sent");
        Ok(invocation_id)
    }

    /// Tear the channel down. Pending calls observe `Disconnected`.
    pub fn disconnect(&self) {
        info!(channel = %self.name, "disconnecting channel");
        self.shutdown.send_replace(true);
        lock(&self.outgoing).take();
        self.state.send_replace(ChannelState::Disconnected);
    }

    /// Reason the initial connection failed, if it did.
    pub(crate) fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Wait until the initial connection attempt settles.
    pub(crate) async fn wait_started(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| !state.is_starting())
            .await
            .map(|state| state.clone())
            .map_err(|_| Error::ChannelUnavailable(format!("{} supervisor stopped", self.name)))?;

        if settled == ChannelState::Disconnected {
            let reason = self
                .last_error()
                .unwrap_or_else(|| format!("{} channel disconnected", self.name));
            return Err(Error::ChannelUnavailable(reason));
        }
        Ok(())
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Publish a supervisor transition unless the channel was torn down.
    fn publish(&self, state: ChannelState) -> bool {
        debug!(channel = %self.name, state = state.label(), "channel state");
        // Checked under the watch lock so a concurrent disconnect always wins
        self.state.send_if_modified(|current| {
            if self.is_shut_down() {
                return false;
            }
            *current = state;
            true
        });
        !self.is_shut_down()
    }

    /// Forward server messages to listeners until the connection ends or the
    /// server stays silent for `server_timeout`.
    async fn pump(
        &self,
        incoming: &mut mpsc::Receiver<HubMessage>,
        shutdown: &mut watch::Receiver<bool>,
        server_timeout: Duration,
    ) -> ChannelEvent {
        let silence = tokio::time::sleep(server_timeout);
        tokio::pin!(silence);

        loop {
            tokio::select! {
                message = incoming.recv() => {
                    // Any inbound record, pings included, proves the server is alive
                    silence.as_mut().reset(Instant::now() + server_timeout);
                    match message {
                        Some(HubMessage::Invocation { target, arguments, .. }) => {
                            // No listeners is not an error
                            let _ = self.events.send(HubEvent::Broadcast { target, arguments });
                        }
                        Some(HubMessage::Completion { invocation_id, error, .. }) => {
                            let _ = self.events.send(HubEvent::Completion { invocation_id, error });
                        }
                        Some(HubMessage::Ping) => {}
                        Some(HubMessage::Close { error, .. }) => {
                            info!(channel = %self.name, error = ?error, "server closed channel");
                            return ChannelEvent::Closed(error);
                        }
                        None => return ChannelEvent::Closed(None),
                    }
                }
                _ = &mut silence => {
                    warn!(
                        channel = %self.name,
                        timeout_ms = server_timeout.as_millis() as u64,
                        "no message from server; treating connection as lost"
                    );
                    return ChannelEvent::Closed(Some("server timeout".to_string()));
                }
                _ = shutdown_signalled(shutdown) => return ChannelEvent::Disconnect,
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bare reason for a failed connect; `wait_started` adds the error kind back.
fn failure_reason(error: Error) -> String {
    match error {
        Error::ChannelUnavailable(reason) | Error::Protocol(reason) => reason,
        other => other.to_string(),
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Drive one channel through its lifecycle until disconnect or initial failure.
pub(crate) async fn supervise(
    channel: Arc<Channel>,
    factory: Arc<dyn ConnectionFactory>,
    tokens: Arc<dyn TokenStore>,
    backoff: BackoffPolicy,
    server_timeout: Duration,
) {
    drive(&channel, factory.as_ref(), tokens.as_ref(), backoff, server_timeout).await;
    lock(&channel.outgoing).take();
    debug!(channel = %channel.name, "channel supervisor stopped");
}

async fn drive(
    channel: &Channel,
    factory: &dyn ConnectionFactory,
    tokens: &dyn TokenStore,
    backoff: BackoffPolicy,
    server_timeout: Duration,
) {
    let mut shutdown = channel.shutdown.subscribe();
    let mut state = channel.state();
    let mut action = ChannelAction::Connect;
    let mut incoming = None;

    loop {
        let event = match action {
            ChannelAction::Connect => {
                let token = tokens.get();
                let result = tokio::select! {
                    result = factory.connect(&channel.name, token) => result,
                    _ = shutdown_signalled(&mut shutdown) => return,
                };
                match result {
                    Ok(connection) => {
                        *lock(&channel.outgoing) = Some(connection.outgoing);
                        incoming = Some(connection.incoming);
                        info!(channel = %channel.name, "channel connected");
                        ChannelEvent::Opened
                    }
                    Err(e) => {
                        warn!(channel = %channel.name, error = %e, "channel connect failed");
                        ChannelEvent::OpenFailed(failure_reason(e))
                    }
                }
            }
            ChannelAction::ScheduleReconnect { delay } => {
                metrics::counter!("access_channel_reconnects_total", "channel" => channel.name.clone())
                    .increment(1);
                info!(
                    channel = %channel.name,
                    delay_ms = delay.as_millis() as u64,
                    "channel reconnecting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => ChannelEvent::BackoffElapsed,
                    _ = shutdown_signalled(&mut shutdown) => ChannelEvent::Disconnect,
                }
            }
            ChannelAction::Fail { .. } | ChannelAction::Teardown => return,
            ChannelAction::None => match incoming.as_mut() {
                Some(rx) => {
                    let event = channel.pump(rx, &mut shutdown, server_timeout).await;
                    incoming = None;
                    lock(&channel.outgoing).take();
                    event
                }
                None => return,
            },
        };

        let (next, next_action) = handle_event(state, event, &backoff);
        // Record the failure before waiters observe Disconnected
        if let ChannelAction::Fail { reason } = &next_action {
            *lock(&channel.last_error) = Some(reason.clone());
        }
        if !channel.publish(next.clone()) {
            return;
        }
        state = next;
        action = next_action;
    }
}
