//! macOS Keychain backend.
//!
//! Every cache key is stored as a generic password under one service name.

use super::SecretStore;
use crate::error::CacheError;
use security_framework::passwords::{
    delete_generic_password, get_generic_password, set_generic_password,
};
use zeroize::Zeroizing;

/// Keychain service identifier.
pub const SERVICE: &str = "com.o365creds.credentials";

/// Secret store backed by the login keychain.
#[derive(Debug, Clone)]
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new(SERVICE)
    }
}

impl SecretStore for KeychainStore {
    fn get(&self, key: &str) -> Result<Option<Zeroizing<String>>, CacheError> {
        let bytes = match get_generic_password(&self.service, key) {
            Ok(bytes) => bytes,
            Err(e) if is_not_found_error(&e) => return Ok(None),
            Err(e) => return Err(CacheError::RetrieveFailed(e.to_string())),
        };

        let value = String::from_utf8(bytes).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(Zeroizing::new(value)))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        set_generic_password(&self.service, key, value.as_bytes())
            .map_err(|e| CacheError::StoreFailed(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        match delete_generic_password(&self.service, key) {
            Ok(()) => Ok(()),
            Err(e) if is_not_found_error(&e) => Ok(()),
            Err(e) => Err(CacheError::DeleteFailed(e.to_string())),
        }
    }
}

/// Helper to check if a security framework error is "item not found".
fn is_not_found_error(error: &security_framework::base::Error) -> bool {
    // errSecItemNotFound = -25300
    error.code() == -25300
}
