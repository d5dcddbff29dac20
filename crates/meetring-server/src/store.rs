//! JSON-file backed [`KeyValueStore`].
//!
//! The whole map lives in one file that is re-read on every operation, so a
//! daemon restarted between wakes (or a second process) sees the latest
//! writes. Writes go to a sibling temp file which is flushed to disk and
//! then renamed over the original.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use meetring_core::{BoxFuture, KeyValueStore, StoreError, StoreResult};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

pub struct FileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoreResult<HashMap<String, Value>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(StoreError::io(e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(HashMap::new());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::corrupt(self.path.display().to_string(), e))
    }

    async fn save(&self, data: &HashMap<String, Value>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(StoreError::io)?;
        }

        let json = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await.map_err(StoreError::io)?;
        restrict_permissions(&tmp).await?;
        file.write_all(&json).await.map_err(StoreError::io)?;
        file.sync_all().await.map_err(StoreError::io)?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(StoreError::io)?;
        debug!(path = %self.path.display(), bytes = json.len(), "store saved");
        Ok(())
    }
}

/// The store holds OAuth tokens; keep it private to the user.
#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> StoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(StoreError::io)
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> StoreResult<()> {
    Ok(())
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, keys: &'a [&'a str]) -> BoxFuture<'a, StoreResult<HashMap<String, Value>>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut data = self.load().await?;
            Ok(keys
                .iter()
                .filter_map(|k| data.remove(*k).map(|v| ((*k).to_string(), v)))
                .collect())
        })
    }

    fn set(&self, entries: HashMap<String, Value>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut data = self.load().await?;
            data.extend(entries);
            self.save(&data).await
        })
    }

    fn remove<'a>(&'a self, keys: &'a [&'a str]) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut data = self.load().await?;
            let before = data.len();
            for key in keys {
                data.remove(*key);
            }
            if data.len() == before {
                return Ok(());
            }
            self.save(&data).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meetring_core::store::{self, keys};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("store.json"));
        assert!(store.get(&[keys::OAUTH_TOKEN]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn values_survive_a_new_instance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let first = FileStore::new(&path);
        store::write(&first, keys::OAUTH_TOKEN, "ya29.token").await.unwrap();
        store::write(&first, keys::PROCESSED_EVENT_IDS, &json!(["a", "b"]))
            .await
            .unwrap();
        drop(first);

        let second = FileStore::new(&path);
        let token: Option<String> = store::read(&second, keys::OAUTH_TOKEN).await.unwrap();
        assert_eq!(token.as_deref(), Some("ya29.token"));
        let values = second
            .get(&[keys::PROCESSED_EVENT_IDS, keys::SETTINGS])
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[keys::PROCESSED_EVENT_IDS], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn remove_ignores_missing_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("store.json"));
        store::write(&store, keys::OAUTH_TOKEN, "t").await.unwrap();
        store::write(&store, keys::TOKEN_EXPIRY, "2025-01-01T00:00:00Z")
            .await
            .unwrap();

        store
            .remove(&[keys::OAUTH_TOKEN, keys::REFRESH_TOKEN])
            .await
            .unwrap();

        let values = store.get(&[keys::OAUTH_TOKEN, keys::TOKEN_EXPIRY]).await.unwrap();
        assert_eq!(values.keys().collect::<Vec<_>>(), vec![keys::TOKEN_EXPIRY]);
    }

    #[tokio::test]
    async fn garbage_file_is_corrupt_not_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = FileStore::new(&path);
        let err = store.get(&[keys::OAUTH_TOKEN]).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_private_to_the_user() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::new(&path);
        store::write(&store, keys::OAUTH_TOKEN, "secret").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn leftover_temp_file_is_replaced() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, b"{\"half-written\": [1, 2, 3, 4, 5, 6, 7, 8, 9").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = FileStore::new(&path);
        store::write(&store, keys::OAUTH_TOKEN, "secret").await.unwrap();

        assert!(!tmp.exists());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let reopened = FileStore::new(&path);
        let token: Option<String> = store::read(&reopened, keys::OAUTH_TOKEN).await.unwrap();
        assert_eq!(token.as_deref(), Some("secret"));
    }
}
