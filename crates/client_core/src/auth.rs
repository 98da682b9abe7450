use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tokio::sync::Mutex;
use tracing::debug;

const USER_ID_KEY: &str = "auth.user_id";
const ACCESS_TOKEN_KEY: &str = "auth.access_token";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: UserId,
    pub access_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Opaque string key/value persistence.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

/// JSON object on disk; every write goes to a temp file that is renamed over
/// the original.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt token store {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read token store {}", self.path.display())),
        }
    }

    async fn write_all(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(values).context("failed to encode token store")?;
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        if values.remove(key).is_some() {
            self.write_all(&values).await?;
        }
        Ok(())
    }
}

/// Persists the signed-in user's credentials.
#[derive(Clone)]
pub struct AuthStore {
    store: Arc<dyn TokenStore>,
}

impl AuthStore {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, credentials: &Credentials) -> Result<()> {
        self.store
            .put(USER_ID_KEY, credentials.user_id.as_str())
            .await?;
        self.store
            .put(ACCESS_TOKEN_KEY, &credentials.access_token)
            .await?;
        debug!(user_id = %credentials.user_id, "auth: credentials saved");
        Ok(())
    }

    /// `None` unless both the user id and a non-empty token are stored.
    pub async fn load(&self) -> Result<Option<Credentials>> {
        let user_id = self.store.get(USER_ID_KEY).await?;
        let token = self.store.get(ACCESS_TOKEN_KEY).await?;
        Ok(match (user_id, token) {
            (Some(user_id), Some(access_token))
                if !user_id.is_empty() && !access_token.is_empty() =>
            {
                Some(Credentials {
                    user_id: UserId::new(user_id),
                    access_token,
                })
            }
            _ => None,
        })
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.delete(ACCESS_TOKEN_KEY).await?;
        self.store.delete(USER_ID_KEY).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir()
            .join(format!("client-core-{name}-{}-{nanos}", std::process::id()))
            .join("tokens.json")
    }

    #[tokio::test]
    async fn memory_store_round_trips_credentials() {
        let auth = AuthStore::new(Arc::new(MemoryTokenStore::new()));
        assert!(auth.load().await.expect("load").is_none());

        let credentials = Credentials {
            user_id: UserId::from("alice"),
            access_token: "secret".into(),
        };
        auth.save(&credentials).await.expect("save");
        assert_eq!(auth.load().await.expect("load"), Some(credentials));

        auth.clear().await.expect("clear");
        assert!(auth.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn file_store_persists_across_instances_and_creates_parent() {
        let path = temp_path("persist");
        let first = FileTokenStore::new(&path);
        first.put("a", "1").await.expect("put a");
        first.put("b", "2").await.expect("put b");
        first.delete("a").await.expect("delete a");

        let second = FileTokenStore::new(&path);
        assert_eq!(second.get("a").await.expect("get a"), None);
        assert_eq!(second.get("b").await.expect("get b"), Some("2".into()));
        assert!(!path.with_extension("json.tmp").exists());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_empty() {
        let path = temp_path("corrupt");
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).expect("dir");
        }
        std::fs::write(&path, b"{not json").expect("write");

        let store = FileTokenStore::new(&path);
        assert!(store.get("anything").await.is_err());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn debug_output_hides_the_token() {
        let credentials = Credentials {
            user_id: UserId::from("alice"),
            access_token: "secret".into(),
        };
        assert!(!format!("{credentials:?}").contains("secret"));
    }
}
