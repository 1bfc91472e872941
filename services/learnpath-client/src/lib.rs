//! Learnpath access layer
//!
//! Wires the credential store, refresh coordinator, REST transport and
//! content hubs into one `AccessLayer` built from configuration.

pub mod config;
pub mod error;
pub mod layer;
pub mod metrics;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use layer::AccessLayer;
