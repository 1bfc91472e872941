//! Realtime content hubs for the learnpath access layer
//!
//! The content generator answers over named duplex channels ("lesson",
//! "chapter") by broadcasting `<X>Loading`, `Receive<X>` and `<X>Error` events
//! to every listener on the channel. This crate turns that into
//! request/response calls with timeouts.
//!
//! Layers, leaves first:
//! 1. `protocol`: JSON hub wire format
//! 2. `state`: pure per-channel connection state machine with capped backoff
//! 3. `connection` / `websocket`: physical connections behind `ConnectionFactory`
//! 4. `channel` / `manager`: one supervised, lazily started channel per name
//! 5. `correlator`: one pending call per invocation, settled exactly once

pub mod channel;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod state;
pub mod websocket;

pub use channel::{Channel, DEFAULT_SERVER_TIMEOUT, HubEvent};
pub use connection::{ConnectFuture, Connection, ConnectionFactory, Peer};
pub use correlator::{ContentKind, CorrelationPolicy, Correlator, EventNames, InvokeOptions};
pub use error::{Error, Result};
pub use manager::ChannelManager;
pub use protocol::HubMessage;
pub use state::{BackoffPolicy, ChannelAction, ChannelEvent, ChannelState, handle_event};
pub use websocket::{WebSocketConnector, hub_base};
