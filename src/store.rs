// src/store.rs
//! Key/value persistence used by the ledger and the scheduler.
//!
//! Values are JSON. Both implementations give read-your-writes consistency
//! within a process; the file store writes atomically (tmp file + rename).

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), EngineError>;
}

/// In-process store; the default for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.inner.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), EngineError> {
        self.inner.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, EngineError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(EngineError::Storage(format!("invalid store key `{key}`")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Storage(format!(
                "reading {}: {e}",
                path.display()
            ))),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        // Unique per write, so concurrent writers never share a tmp file.
        let tmp = self
            .dir
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_vec(&value)?;
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(EngineError::Storage(format!(
                "writing {}: {e}",
                tmp.display()
            )));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(EngineError::Storage(format!(
                "replacing {}: {e}",
                path.display()
            )));
        }
        Ok(())
    }
}
