//! Authenticated REST transport
//!
//! `TransportClient` attaches the session credential to every request except
//! those on the public allow-list, unwraps `{ "value": T }` envelopes, and
//! recovers from an expired credential by refreshing once and replaying the
//! call.

pub mod client;
pub mod envelope;
pub mod error;
pub mod request;

pub use client::TransportClient;
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use request::RequestConfig;
