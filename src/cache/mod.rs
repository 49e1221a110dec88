//! Persisted credential storage.
//!
//! Secrets live in a platform store (macOS Keychain, or owner-only files
//! elsewhere) behind the small [`SecretStore`] contract. [`CredentialCache`]
//! layers typed JSON entries and cross-process locking on top of it.

#[cfg(target_os = "macos")]
pub mod keychain;

pub mod file;
pub mod lock;
pub mod secure;
pub mod token_cache;

use crate::config::CacheConfig;
use crate::error::{AppError, CacheError};
use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use file::FileStore;
pub use lock::StoreLock;
pub use secure::SecureString;
pub use token_cache::{CachedAccount, TokenCacheData};

/// Key of the OAuth token cache entry.
pub const OAUTH_CACHE_KEY: &str = "oauth_token_cache";

/// Key of the harvested cookie credential entry.
pub const COOKIE_CACHE_KEY: &str = "forms_cookie_cache";

/// Default wait for another process to release a cache lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Get/set/clear contract every storage backend provides.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Zeroizing<String>>, CacheError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process store. Nothing outlives the value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl SecretStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Zeroizing<String>>, CacheError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::RetrieveFailed(e.to_string()))?;
        Ok(entries.get(key).cloned().map(Zeroizing::new))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::StoreFailed(e.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::DeleteFailed(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Default directory for cache files and lock files.
pub fn default_cache_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "o365creds", "o365creds").map(|dirs| dirs.data_local_dir().to_path_buf())
}

/// Typed, lock-protected view over a [`SecretStore`].
#[derive(Clone)]
pub struct CredentialCache {
    store: Arc<dyn SecretStore>,
    lock_dir: PathBuf,
    lock_timeout: Duration,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn SecretStore>, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            lock_dir: lock_dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Cache over an in-process store; lock files still go to `lock_dir`.
    pub fn in_memory(lock_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(MemoryStore::default()), lock_dir)
    }

    /// Open the platform-appropriate store described by configuration.
    pub fn open(config: &CacheConfig) -> Result<Self, AppError> {
        let dir = match &config.dir {
            Some(dir) => dir.clone(),
            None => default_cache_dir()
                .ok_or_else(|| AppError::Config("Could not determine cache directory".into()))?,
        };

        let store: Arc<dyn SecretStore> = match config.backend.as_str() {
            "file" => Arc::new(FileStore::new(&dir)),
            "memory" => Arc::new(MemoryStore::default()),
            "keychain" => keychain_store()?,
            "auto" => keychain_store().unwrap_or_else(|_| Arc::new(FileStore::new(&dir))),
            other => {
                return Err(AppError::Config(format!(
                    "Unknown cache backend '{}'",
                    other
                )))
            }
        };

        info!("Credential cache opened ({} backend) at {}", config.backend, dir.display());
        Ok(Self::new(store, dir).with_lock_timeout(Duration::from_secs(config.lock_timeout_seconds)))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Take the cross-process lock for `key`.
    pub async fn lock(&self, key: &str) -> Result<StoreLock, AppError> {
        Ok(StoreLock::acquire(&self.lock_dir, key, self.lock_timeout).await?)
    }

    /// Read an entry. Unreadable JSON is treated as a miss.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        let Some(raw) = self.store.get(key)? else {
            debug!("Cache miss for {}", key);
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Write an entry. The caller must hold the lock for `key`.
    pub fn write<T: Serialize>(&self, _lock: &StoreLock, key: &str, value: &T) -> Result<(), AppError> {
        let json = Zeroizing::new(serde_json::to_string(value)?);
        self.store.set(key, &json)?;
        Ok(())
    }

    /// Lock, write, unlock.
    pub async fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AppError> {
        let lock = self.lock(key).await?;
        self.write(&lock, key, value)
    }

    /// Lock, read (or default), modify, write, unlock.
    pub async fn update<T, R, F>(&self, key: &str, f: F) -> Result<R, AppError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        let lock = self.lock(key).await?;
        let mut value: T = self.load(key)?.unwrap_or_default();
        let result = f(&mut value);
        self.write(&lock, key, &value)?;
        Ok(result)
    }

    /// Remove one entry under its lock.
    pub async fn remove(&self, key: &str) -> Result<(), AppError> {
        let _lock = self.lock(key).await?;
        self.store.delete(key)?;
        Ok(())
    }

    /// Erase both the OAuth cache and the cookie cache.
    ///
    /// Both locks are held while deleting so no acquisition can interleave
    /// and repopulate one store in between.
    pub async fn clear(&self) -> Result<(), AppError> {
        let _oauth = self.lock(OAUTH_CACHE_KEY).await?;
        let _cookies = self.lock(COOKIE_CACHE_KEY).await?;
        self.store.delete(OAUTH_CACHE_KEY)?;
        self.store.delete(COOKIE_CACHE_KEY)?;
        info!("Credential cache cleared");
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn keychain_store() -> Result<Arc<dyn SecretStore>, AppError> {
    Ok(Arc::new(keychain::KeychainStore::default()))
}

#[cfg(not(target_os = "macos"))]
fn keychain_store() -> Result<Arc<dyn SecretStore>, AppError> {
    Err(AppError::Config(
        "Keychain backend is only available on macOS".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        hits: u32,
    }

    #[tokio::test]
    async fn test_update_creates_and_modifies() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::in_memory(dir.path());

        let hits = cache
            .update("counter", |c: &mut Counter| {
                c.hits += 1;
                c.hits
            })
            .await
            .unwrap();
        assert_eq!(hits, 1);

        cache
            .update("counter", |c: &mut Counter| c.hits += 1)
            .await
            .unwrap();
        assert_eq!(cache.load::<Counter>("counter").unwrap(), Some(Counter { hits: 2 }));
    }

    #[tokio::test]
    async fn test_clear_removes_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(Arc::new(FileStore::new(dir.path())), dir.path());

        cache.store(OAUTH_CACHE_KEY, &TokenCacheData::default()).await.unwrap();
        cache.store(COOKIE_CACHE_KEY, &Counter { hits: 3 }).await.unwrap();
        cache.clear().await.unwrap();

        assert!(cache.load::<TokenCacheData>(OAUTH_CACHE_KEY).unwrap().is_none());
        assert!(cache.load::<Counter>(COOKIE_CACHE_KEY).unwrap().is_none());
        // locks were released
        assert!(cache.lock(OAUTH_CACHE_KEY).await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.set(OAUTH_CACHE_KEY, "{not json").unwrap();
        let cache = CredentialCache::new(store, dir.path());

        assert!(cache.load::<TokenCacheData>(OAUTH_CACHE_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_waits_for_lock() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::in_memory(dir.path())
            .with_lock_timeout(Duration::from_millis(100));

        let held = cache.lock(COOKIE_CACHE_KEY).await.unwrap();
        let blocked = cache.store(COOKIE_CACHE_KEY, &Counter::default()).await;
        assert!(matches!(
            blocked,
            Err(AppError::Cache(CacheError::LockTimeout(_)))
        ));
        drop(held);
        assert!(cache.store(COOKIE_CACHE_KEY, &Counter::default()).await.is_ok());
    }

    #[test]
    fn test_open_rejects_unknown_backend() {
        let config = CacheConfig {
            backend: "floppy".into(),
            dir: Some(std::env::temp_dir()),
            lock_timeout_seconds: 1,
        };
        assert!(matches!(
            CredentialCache::open(&config),
            Err(AppError::Config(_))
        ));
    }
}
