use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};

/// Wraps an API key with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Provider credential shared between the composition root and the providers.
///
/// Every change bumps a monotonic version; providers read `(version, key)` at
/// call time, so a rotation applies to the next call and never to one in flight.
#[derive(Debug, Default)]
pub struct Credentials {
    key: RwLock<Option<ApiKey>>,
    version: AtomicU64,
}

impl Credentials {
    pub fn new(key: Option<ApiKey>) -> Self {
        Self {
            key: RwLock::new(key),
            version: AtomicU64::new(0),
        }
    }

    pub fn from_option(key: Option<String>) -> Self {
        Self::new(key.filter(|k| !k.trim().is_empty()).map(ApiKey::new))
    }

    /// Snapshot of the active key and the version it was read at.
    pub fn current(&self) -> (u64, Option<ApiKey>) {
        let key = self.key.read();
        (self.version.load(Ordering::Acquire), key.clone())
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_set(&self) -> bool {
        self.key.read().is_some()
    }

    /// Replace the active key (`None` clears it). Returns the new version.
    pub fn rotate(&self, key: Option<ApiKey>) -> u64 {
        let mut slot = self.key.write();
        *slot = key;
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }
}
