//! In-memory config store

use super::{split_path, ConfigStore, StoreValue};
use crate::error::{KeelError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Store that lives for the process, used for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<BTreeMap<String, StoreValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All paths currently set
    pub fn paths(&self) -> Result<Vec<String>> {
        let values = self
            .values
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(values.keys().cloned().collect())
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, path: &str) -> Result<Option<StoreValue>> {
        split_path(path)?;
        let values = self
            .values
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(values.get(path).cloned())
    }

    fn set(&self, path: &str, value: StoreValue) -> Result<()> {
        split_path(path)?;
        let mut values = self
            .values
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;
        values.insert(path.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let store = MemoryStore::new();
        store
            .set_many(vec![
                ("ssh.fingerprint".to_string(), StoreValue::plain("SHA256:abc")),
                ("ssh.private_key".to_string(), StoreValue::secret("-----BEGIN")),
            ])
            .unwrap();

        assert_eq!(store.get_plain("ssh.fingerprint").unwrap().as_deref(), Some("SHA256:abc"));
        assert!(store.get("ssh.private_key").unwrap().unwrap().is_secret());
        assert_eq!(store.paths().unwrap(), vec!["ssh.fingerprint", "ssh.private_key"]);
        assert!(store.get(".bad").is_err());
    }
}
