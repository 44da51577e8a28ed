//! The `CredentialStore` seam and an in-memory implementation

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Persistent key-value store for credentials.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialStore>`). Implementations validate keys with
/// [`validate_key`] and must never log values.
pub trait CredentialStore: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove every listed key. Missing keys are not an error.
    fn remove<'a>(
        &'a self,
        keys: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Reject keys outside `[A-Za-z0-9._-]+`.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            validate_key(key)?;
            Ok(self.state.lock().await.get(key).cloned())
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            validate_key(key)?;
            self.state.lock().await.insert(key.to_string(), value);
            debug!(key, "stored credential");
            Ok(())
        })
    }

    fn remove<'a>(
        &'a self,
        keys: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            for key in keys {
                validate_key(key)?;
            }
            let mut state = self.state.lock().await;
            for key in keys {
                state.remove(*key);
            }
            debug!(count = keys.len(), "removed credentials");
            Ok(())
        })
    }
}
