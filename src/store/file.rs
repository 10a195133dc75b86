//! YAML-file config store

use super::{split_path, ConfigStore, StoreValue};
use crate::error::{KeelError, Result};
use crate::secret::Secret;
use base64::Engine;
use serde_yaml::{Mapping, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SECRET_KEY: &str = "secret";

/// Store kept in a single YAML document
///
/// Sections are nested mappings. Secret values are stored as
/// `{ secret: <base64> }` so they are never printed by a casual `cat`, and
/// the file is written with mode 0600.
pub struct FileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles in this process
    guard: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// `<data dir>/keel/store.yaml`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keel")
            .join("store.yaml")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Value> {
        if !self.path.exists() {
            return Ok(Value::Mapping(Mapping::new()));
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Value::Mapping(Mapping::new()));
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    fn save(&self, root: &Value) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let content = serde_yaml::to_string(root)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(&self.path).map_err(|e| KeelError::Io(e.error))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.guard
            .lock()
            .map_err(|_| KeelError::Lock("Failed to acquire store lock".to_string()))
    }
}

fn encode(value: &StoreValue) -> Value {
    match value {
        StoreValue::Plain(v) => Value::String(v.clone()),
        StoreValue::Secret(s) => {
            let mut map = Mapping::new();
            map.insert(
                Value::String(SECRET_KEY.to_string()),
                Value::String(base64::engine::general_purpose::STANDARD.encode(s.expose())),
            );
            Value::Mapping(map)
        }
    }
}

fn decode(path: &str, value: &Value) -> Result<StoreValue> {
    match value {
        Value::String(s) => Ok(StoreValue::Plain(s.clone())),
        Value::Number(n) => Ok(StoreValue::Plain(n.to_string())),
        Value::Bool(b) => Ok(StoreValue::Plain(b.to_string())),
        Value::Mapping(map) if map.len() == 1 => {
            let encoded = map
                .get(SECRET_KEY)
                .and_then(Value::as_str)
                .ok_or_else(|| KeelError::Store(format!("{} is a section, not a value", path)))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| KeelError::Store(format!("{}: bad secret encoding: {}", path, e)))?;
            let text = String::from_utf8(bytes)
                .map_err(|e| KeelError::Store(format!("{}: secret is not UTF-8: {}", path, e)))?;
            Ok(StoreValue::Secret(Secret::new(text)))
        }
        _ => Err(KeelError::Store(format!("{} is a section, not a value", path))),
    }
}

fn lookup<'a>(root: &'a Value, parts: &[&str]) -> Option<&'a Value> {
    parts.iter().try_fold(root, |node, part| node.as_mapping()?.get(*part))
}

fn insert(root: &mut Value, path: &str, parts: &[&str], value: Value) -> Result<()> {
    let Some((last, sections)) = parts.split_last() else {
        return Err(KeelError::Store("Empty store path".to_string()));
    };

    let mut node = root;
    for part in sections {
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| KeelError::Store(format!("{}: '{}' is not a section", path, part)))?;
        let key = Value::String(part.to_string());
        if !map.contains_key(&key) {
            map.insert(key.clone(), Value::Mapping(Mapping::new()));
        }
        node = map
            .get_mut(&key)
            .ok_or_else(|| KeelError::Internal(format!("{}: section vanished", path)))?;
    }

    node.as_mapping_mut()
        .ok_or_else(|| KeelError::Store(format!("{}: parent is not a section", path)))?
        .insert(Value::String(last.to_string()), value);
    Ok(())
}

impl ConfigStore for FileStore {
    fn get(&self, path: &str) -> Result<Option<StoreValue>> {
        let parts = split_path(path)?;
        let _guard = self.lock()?;
        let root = self.load()?;
        lookup(&root, &parts).map(|v| decode(path, v)).transpose()
    }

    fn set(&self, path: &str, value: StoreValue) -> Result<()> {
        self.set_many(vec![(path.to_string(), value)])
    }

    fn set_many(&self, entries: Vec<(String, StoreValue)>) -> Result<()> {
        let _guard = self.lock()?;
        let mut root = self.load()?;
        for (path, value) in &entries {
            let parts = split_path(path)?;
            insert(&mut root, path, &parts, encode(value))?;
        }
        self.save(&root)
    }
}
