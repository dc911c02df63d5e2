//! Credential store shared between the reclaimer and the proxy
//!
//! The store is a single-value cell built on `tokio::sync::watch`:
//! - `set` is an exclusive replace of the whole value
//! - `get` clones an `Arc` out of a short read borrow
//! - readers never see a half-written credential, and never block the writer
//!   for longer than that clone

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::Credentials;

/// One installed credential value and its position in the rotation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSnapshot {
    /// 1 for the credentials of the initial claim, +1 for every later value
    pub generation: u64,
    pub credentials: Arc<Credentials>,
}

/// Atomically swappable holder of the current task credentials
#[derive(Clone)]
pub struct CredentialStore {
    tx: Arc<watch::Sender<Option<CredentialSnapshot>>>,
}

impl CredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Create a store already holding the initial claim's credentials
    pub fn with_credentials(credentials: impl Into<Arc<Credentials>>) -> Self {
        let store = Self::new();
        store.set(credentials);
        store
    }

    /// Install a credential value and return its generation.
    ///
    /// Installing a value equal to the current one changes nothing and
    /// returns the existing generation.
    pub fn set(&self, credentials: impl Into<Arc<Credentials>>) -> u64 {
        let credentials = credentials.into();
        let mut generation = 0;

        self.tx.send_if_modified(|current| {
            let unchanged = current
                .as_ref()
                .filter(|s| *s.credentials == *credentials)
                .map(|s| s.generation);
            if let Some(existing) = unchanged {
                generation = existing;
                return false;
            }

            generation = current.as_ref().map_or(1, |s| s.generation + 1);
            *current = Some(CredentialSnapshot {
                generation,
                credentials: credentials.clone(),
            });
            true
        });

        generation
    }

    /// Current snapshot, `None` until the first `set`
    pub fn get(&self) -> Option<CredentialSnapshot> {
        self.tx.borrow().clone()
    }

    /// Current generation, 0 while empty
    pub fn generation(&self) -> u64 {
        self.tx.borrow().as_ref().map_or(0, |s| s.generation)
    }

    /// Wait until the store holds credentials, for at most `timeout`
    pub async fn wait_ready(&self, timeout: Duration) -> Option<CredentialSnapshot> {
        if let Some(snapshot) = self.get() {
            return Some(snapshot);
        }

        let mut rx = self.tx.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .ok()?
            .ok()
            .and_then(|snapshot| snapshot.clone());
        result
    }

    /// Watch for rotations
    pub fn subscribe(&self) -> watch::Receiver<Option<CredentialSnapshot>> {
        self.tx.subscribe()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("generation", &self.generation())
            .finish()
    }
}
