//! Session credential lifecycle for the learnpath access layer
//!
//! Holds the current bearer credential and coordinates refreshing it. The
//! refresh endpoint authenticates with the session cookie, never with the
//! expired bearer, so the HTTP client handed to `HttpRefresher` must have its
//! cookie store enabled.
//!
//! Credential flow:
//! 1. Login succeeds in the UI, which calls `RefreshCoordinator::install()`
//! 2. Transport attaches `TokenStore::get()` to every non-public request
//! 3. A 401 calls `RefreshCoordinator::refresh()`; concurrent callers share one refresh
//! 4. Success stores the new credential; failure clears the store
//! 5. Logout calls `RefreshCoordinator::revoke()`

pub mod coordinator;
pub mod credentials;
pub mod endpoints;
pub mod error;
pub mod token;

pub use coordinator::RefreshCoordinator;
pub use credentials::{Credential, MemoryTokenStore, TokenStore};
pub use endpoints::{AUTH_FAMILY_PATHS, PUBLIC_PATHS, REFRESH_PATH, api_base, is_auth_family, is_public};
pub use error::{Error, Result};
pub use token::{HttpRefresher, RefreshFuture, TokenRefresher, refresh_token};
