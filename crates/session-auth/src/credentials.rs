//! Credential storage for the current session
//!
//! The store holds at most one bearer credential. Expiry is never decoded from
//! the token; it is discovered when a protected call returns 401. Every reader
//! takes a snapshot per call, so a refresh that lands mid-flight is picked up
//! by the next request rather than mutating one already on the wire.

use std::fmt;
use std::sync::RwLock;

use common::Secret;
use tracing::debug;

/// Opaque bearer token granting API access.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Secret<String>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    /// Raw token value. Used for connect-time hub authentication.
    pub fn token(&self) -> &str {
        self.0.expose()
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0.expose())
    }
}

impl From<Secret<String>> for Credential {
    fn from(secret: Secret<String>) -> Self {
        Self(secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.0).finish()
    }
}

/// Single source of truth for the session credential.
///
/// Synchronous and free of I/O. Only `RefreshCoordinator` writes to it.
pub trait TokenStore: Send + Sync {
    fn get(&self) -> Option<Credential>;

    fn set(&self, credential: Option<Credential>);

    fn clear(&self) {
        self.set(None);
    }
}

/// In-memory `TokenStore`.
#[derive(Default)]
pub struct MemoryTokenStore {
    current: RwLock<Option<Credential>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an existing credential (e.g. restored at startup).
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            current: RwLock::new(Some(credential)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, credential: Option<Credential>) {
        let present = credential.is_some();
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credential;
        debug!(present, "credential updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_store_returns_none() {
        let store = MemoryTokenStore::new();
        assert!(store.get().is_none());
    }

    #[test]
    fn set_then_get_returns_snapshot() {
        let store = MemoryTokenStore::new();
        store.set(Some(Credential::new("T1")));
        let snapshot = store.get().unwrap();
        store.set(Some(Credential::new("T2")));

        assert_eq!(snapshot.token(), "T1");
        assert_eq!(store.get().unwrap().token(), "T2");
    }

    #[test]
    fn clear_removes_credential() {
        let store = MemoryTokenStore::with_credential(Credential::new("T1"));
        store.clear();
        assert!(store.get().is_none());
    }

    #[test]
    fn bearer_formats_authorization_value() {
        assert_eq!(Credential::new("abc").bearer(), "Bearer abc");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let debug = format!("{:?}", Credential::new("super-secret"));
        assert!(!debug.contains("super-secret"), "got: {debug}");
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn usable_as_trait_object_across_threads() {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.set(Some(Credential::new(format!("T{i}")))))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(store.get().unwrap().token().starts_with('T'));
    }
}
