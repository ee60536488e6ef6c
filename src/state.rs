//! File-backed key/value store shared by scripts and the `state` commands.
//!
//! Every operation loads the JSON file, applies its change and writes it
//! back while holding one mutex, so concurrent script runs in the same
//! process never interleave a read-modify-write.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.guard()?;
        Ok(self.load()?.get(key).cloned())
    }

    pub fn get_all(&self) -> Result<Map<String, Value>> {
        let _guard = self.guard()?;
        self.load()
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.guard()?;
        let mut data = self.load()?;
        data.insert(key.to_string(), value);
        self.persist(&data)
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.guard()?;
        let mut data = self.load()?;
        let existed = data.remove(key).is_some();
        if existed {
            self.persist(&data)?;
        }
        Ok(existed)
    }

    pub fn list_keys(&self) -> Result<Vec<String>> {
        let _guard = self.guard()?;
        Ok(self.load()?.keys().cloned().collect())
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self.guard()?;
        self.persist(&Map::new())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| Error::Store("state lock poisoned".into()))
    }

    fn load(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Store(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::Store(format!(
                "{} does not contain a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(Error::Store(format!(
                "cannot parse {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn persist(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Store(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        let text = serde_json::to_string_pretty(data)
            .map_err(|e| Error::Store(format!("cannot encode state: {}", e)))?;
        std::fs::write(&self.path, text)
            .map_err(|e| Error::Store(format!("cannot write {}: {}", self.path.display(), e)))
    }
}
