//! Channel connection state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The channel supervisor executes the I/O implied by each action, so every
//! transition and backoff value is testable without sockets or timers.
//!
//! ```text
//! Disconnected --Start--> Connecting{0} --Opened--> Connected
//! Connecting{0} --OpenFailed--> Disconnected            (surfaced to the caller)
//! Connected --Closed--> Reconnecting{1} --BackoffElapsed--> Connecting{1}
//! Connecting{n>0} --OpenFailed--> Reconnecting{n+1}
//! any --Disconnect--> Disconnected
//! ```
//!
//! Reconnection never gives up on its own; only an explicit disconnect ends it.

use std::time::Duration;

/// Per-channel connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    /// Attempt 0 is the initial start; later attempts are reconnects.
    Connecting { attempt: u32 },
    Connected,
    /// Waiting out the backoff before reconnect `attempt`.
    Reconnecting { attempt: u32 },
}

impl ChannelState {
    /// Label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting { .. } => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Reconnecting { .. } => "reconnecting",
        }
    }

    /// Still waiting on the first connection attempt.
    pub fn is_starting(&self) -> bool {
        matches!(self, ChannelState::Connecting { attempt: 0 })
    }
}

/// Events that drive channel transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// First use of the channel
    Start,
    /// Physical connection established and handshake accepted
    Opened,
    /// Connection attempt failed
    OpenFailed(String),
    /// Established connection dropped
    Closed(Option<String>),
    /// Reconnect backoff expired
    BackoffElapsed,
    /// Explicit teardown
    Disconnect,
}

/// Actions the supervisor should execute after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Open a physical connection with a freshly read token
    Connect,
    /// Wait, then emit `BackoffElapsed`
    ScheduleReconnect { delay: Duration },
    /// Initial connection failed; report to whoever is waiting on it
    Fail { reason: String },
    /// Release the connection and stop supervising
    Teardown,
    /// No-op
    None,
}

/// Exponential reconnect backoff: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: ChannelState,
    event: ChannelEvent,
    backoff: &BackoffPolicy,
) -> (ChannelState, ChannelAction) {
    match (state, event) {
        // --- Explicit teardown wins from any state ---
        (ChannelState::Disconnected, ChannelEvent::Disconnect) => {
            (ChannelState::Disconnected, ChannelAction::None)
        }
        (_, ChannelEvent::Disconnect) => (ChannelState::Disconnected, ChannelAction::Teardown),

        // --- Disconnected ---
        (ChannelState::Disconnected, ChannelEvent::Start) => (
            ChannelState::Connecting { attempt: 0 },
            ChannelAction::Connect,
        ),

        // --- Connecting ---
        (ChannelState::Connecting { .. }, ChannelEvent::Opened) => {
            (ChannelState::Connected, ChannelAction::None)
        }

        (ChannelState::Connecting { attempt: 0 }, ChannelEvent::OpenFailed(reason)) => {
            (ChannelState::Disconnected, ChannelAction::Fail { reason })
        }

        (ChannelState::Connecting { attempt }, ChannelEvent::OpenFailed(_)) => {
            let next = attempt.saturating_add(1);
            (
                ChannelState::Reconnecting { attempt: next },
                ChannelAction::ScheduleReconnect {
                    delay: backoff.delay(next),
                },
            )
        }

        // --- Connected ---
        (ChannelState::Connected, ChannelEvent::Closed(_)) => (
            ChannelState::Reconnecting { attempt: 1 },
            ChannelAction::ScheduleReconnect {
                delay: backoff.delay(1),
            },
        ),

        // --- Reconnecting ---
        (ChannelState::Reconnecting { attempt }, ChannelEvent::BackoffElapsed) => (
            ChannelState::Connecting { attempt },
            ChannelAction::Connect,
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ChannelAction::None),
    }
}
