//! External configuration store
//!
//! A hierarchical key/value store addressed by dotted paths
//! (`ssh.last_rotation`, `k3s.token`). Values are either plain or marked
//! secret. Only the rotators write to it.

pub mod file;
pub mod memory;
pub mod mirror;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use mirror::{publish_best_effort, MirrorRecord, SecretMirror, WebhookMirror};

use crate::error::{KeelError, Result};
use crate::secret::Secret;

/// A stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreValue {
    Plain(String),
    Secret(Secret),
}

impl StoreValue {
    pub fn plain(value: impl Into<String>) -> Self {
        StoreValue::Plain(value.into())
    }

    pub fn secret(value: impl Into<String>) -> Self {
        StoreValue::Secret(Secret::new(value))
    }

    /// The raw value, secret or not
    pub fn expose(&self) -> &str {
        match self {
            StoreValue::Plain(v) => v,
            StoreValue::Secret(s) => s.expose(),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, StoreValue::Secret(_))
    }
}

/// Dotted-path key/value store
pub trait ConfigStore: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<StoreValue>>;

    fn set(&self, path: &str, value: StoreValue) -> Result<()>;

    /// Write several values; stores that can make this atomic should
    fn set_many(&self, entries: Vec<(String, StoreValue)>) -> Result<()> {
        for (path, value) in entries {
            self.set(&path, value)?;
        }
        Ok(())
    }

    /// Plain value; a secret at `path` is an error
    fn get_plain(&self, path: &str) -> Result<Option<String>> {
        match self.get(path)? {
            Some(StoreValue::Plain(v)) => Ok(Some(v)),
            Some(StoreValue::Secret(_)) => Err(KeelError::Store(format!(
                "{} holds a secret, expected a plain value",
                path
            ))),
            None => Ok(None),
        }
    }

    fn get_secret(&self, path: &str) -> Result<Option<Secret>> {
        Ok(self.get(path)?.map(|v| match v {
            StoreValue::Secret(s) => s,
            StoreValue::Plain(p) => Secret::new(p),
        }))
    }
}

/// Reject empty paths and empty segments
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(KeelError::Store(format!("Invalid store path: '{}'", path)));
    }
    Ok(parts)
}
