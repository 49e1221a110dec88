//! File-backed secret store for hosts without a native keystore.
//!
//! Each key is one JSON file. Writes go through a temporary file in the same
//! directory followed by a rename, so readers see either the old or the new
//! entry and never a partial one.

use super::SecretStore;
use crate::error::CacheError;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// Secret store keeping one file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl SecretStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Zeroizing<String>>, CacheError> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => {
                let value = String::from_utf8(bytes).map_err(|e| CacheError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(Zeroizing::new(value)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::RetrieveFailed(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|e| CacheError::StoreFailed(e.to_string()))?;

        let mut tmp =
            NamedTempFile::new_in(&self.dir).map_err(|e| CacheError::StoreFailed(e.to_string()))?;
        tmp.write_all(value.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| CacheError::StoreFailed(e.to_string()))?;

        // Entries hold tokens and cookies
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
                .map_err(|e| CacheError::StoreFailed(e.to_string()))?;
        }

        tmp.persist(self.entry_path(key))
            .map_err(|e| CacheError::StoreFailed(e.error.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::DeleteFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_overwrite_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));

        assert!(store.get("oauth_token_cache").unwrap().is_none());

        store.set("oauth_token_cache", r#"{"accounts":[]}"#).unwrap();
        store.set("oauth_token_cache", r#"{"accounts":[1]}"#).unwrap();
        let value = store.get("oauth_token_cache").unwrap().unwrap();
        assert_eq!(value.as_str(), r#"{"accounts":[1]}"#);

        store.delete("oauth_token_cache").unwrap();
        assert!(store.get("oauth_token_cache").unwrap().is_none());
        // deleting a missing entry is not an error
        store.delete("oauth_token_cache").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_entries_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.set("forms_cookie_cache", "{}").unwrap();

        let mode = fs::metadata(dir.path().join("forms_cookie_cache.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
