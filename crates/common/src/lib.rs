//! Shared types for the learnpath access layer

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
