//! JSON file credential store
//!
//! Persists a flat `{ key: value }` JSON object. All writes use atomic
//! temp-file + rename to prevent corruption on crash, and a tokio Mutex
//! serializes concurrent writes from request-time refresh and logout.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::{CredentialStore, validate_key};

/// Credential store backed by a JSON file.
///
/// The whole map is held in memory; reads never touch the disk after load.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileCredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (signed-out cold start).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing credential file: {e}")))?;
            for key in entries.keys() {
                validate_key(key)?;
            }
            info!(path = %path.display(), keys = entries.len(), "loaded credentials");
            entries
        } else {
            info!(path = %path.display(), "credential file not found, starting signed out");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
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
            let mut state = self.state.lock().await;
            state.insert(key.to_string(), value);
            debug!(key, "stored credential");
            write_atomic(&self.path, &state).await
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
            let before = state.len();
            for key in keys {
                state.remove(*key);
            }
            if state.len() != before {
                debug!(removed = before - state.len(), "removed credentials");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The file holds bearer tokens, so it is created 0600 on unix.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store
            .set("client.access_token", "at_1".into())
            .await
            .unwrap();
        store
            .set("client.refresh_token", "rt_1".into())
            .await
            .unwrap();

        let reloaded = FileCredentialStore::load(path).await.unwrap();
        assert_eq!(
            reloaded.get("client.access_token").await.unwrap().as_deref(),
            Some("at_1")
        );
        assert_eq!(
            reloaded.get("client.refresh_token").await.unwrap().as_deref(),
            Some("rt_1")
        );
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        assert!(!path.exists());
        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        assert_eq!(store.get("client.access_token").await.unwrap(), None);
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.set("a", "1".into()).await.unwrap();
        store.set("b", "2".into()).await.unwrap();
        store.remove(&["a", "never-set"]).await.unwrap();

        let reloaded = FileCredentialStore::load(path).await.unwrap();
        assert_eq!(reloaded.get("a").await.unwrap(), None);
        assert_eq!(reloaded.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let result = FileCredentialStore::load(path).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn file_with_invalid_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, r#"{"@legacy:token":"x"}"#)
            .await
            .unwrap();

        let result = FileCredentialStore::load(path).await;
        assert!(matches!(result, Err(Error::InvalidKey(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.set("client.access_token", "at".into()).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = std::sync::Arc::new(FileCredentialStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("key-{i}");
                store.set(&key, i.to_string()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
