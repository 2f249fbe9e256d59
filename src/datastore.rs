//! Shared key/value artifact space threaded through a run.
//!
//! Links communicate only through the [`DataStore`]: every `set` is visible
//! to every link that executes afterwards. Artifacts are stored as JSON
//! values, so the whole store can be written to disk and read back.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// An opaque artifact held by the data store.
pub type Artifact = Value;

/// Errors raised by data store access and persistence.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DataStoreError {
    /// The requested key is not present.
    #[error("Key not found in data store: {0}")]
    KeyNotFound(String),

    /// The artifact exists but could not be read as the requested type.
    #[error("Type mismatch for key {key}: expected {expected} ({reason})")]
    TypeMismatch {
        /// The key that was read.
        key: String,
        /// Name of the requested Rust type.
        expected: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// A value could not be encoded as an artifact.
    #[error("Failed to encode artifact for key {key}: {reason}")]
    Encode {
        /// The key that was written.
        key: String,
        /// Encoder message.
        reason: String,
    },

    /// Reading or writing a persisted store failed.
    #[error("Data store I/O error at {path}: {reason}")]
    Io {
        /// Path of the persisted store.
        path: String,
        /// Underlying I/O message.
        reason: String,
    },

    /// A persisted store could not be decoded.
    #[error("Failed to decode data store: {0}")]
    Codec(String),
}

/// Ordered mapping from key to artifact.
///
/// Keys are unique and kept sorted. The store is type-agnostic: a key holds
/// whatever its producing link put there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataStore {
    entries: BTreeMap<String, Artifact>,
}

impl DataStore {
    /// Create an empty data store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the raw artifact stored under `key`.
    pub fn get(&self, key: &str) -> Result<&Artifact, DataStoreError> {
        self.entries
            .get(key)
            .ok_or_else(|| DataStoreError::KeyNotFound(key.to_string()))
    }

    /// Get the artifact under `key` decoded as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, DataStoreError> {
        let value = self.get(key)?;
        T::deserialize(value).map_err(|e| DataStoreError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    /// Get a mutable reference to the raw artifact under `key`.
    pub fn get_mut(&mut self, key: &str) -> Result<&mut Artifact, DataStoreError> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| DataStoreError::KeyNotFound(key.to_string()))
    }

    /// Store a raw artifact, returning the previous one if any.
    pub fn set_value(&mut self, key: impl Into<String>, value: Artifact) -> Option<Artifact> {
        self.entries.insert(key.into(), value)
    }

    /// Encode `value` and store it under `key`, silently overwriting.
    pub fn set<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<Option<Artifact>, DataStoreError> {
        let key = key.into();
        let encoded = serde_json::to_value(value).map_err(|e| DataStoreError::Encode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok(self.set_value(key, encoded))
    }

    /// Check whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove `key`, returning its artifact.
    pub fn remove(&mut self, key: &str) -> Option<Artifact> {
        self.entries.remove(key)
    }

    /// Keep only the keys for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|k, _| keep(k));
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored artifacts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Write the whole mapping to `path` as JSON.
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<(), DataStoreError> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| DataStoreError::Codec(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| io_error(path, e))?;
        tracing::debug!(path = %path.display(), entries = self.len(), "datastore.persisted");
        Ok(())
    }

    /// Replace the in-memory mapping wholesale with the one stored at `path`.
    ///
    /// On error the current contents are left untouched.
    pub async fn restore(&mut self, path: impl AsRef<Path>) -> Result<(), DataStoreError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
        let restored: DataStore =
            serde_json::from_slice(&bytes).map_err(|e| DataStoreError::Codec(e.to_string()))?;
        *self = restored;
        tracing::debug!(path = %path.display(), entries = self.len(), "datastore.restored");
        Ok(())
    }

    /// Log the key and artifact kind of every entry.
    pub fn log_summary(&self) {
        tracing::info!(entries = self.len(), "datastore.summary");
        for (key, value) in self.iter() {
            tracing::info!(key, kind = kind_of(value), "datastore.entry");
        }
    }
}

/// JSON kind of an artifact, used in summaries.
pub fn kind_of(value: &Artifact) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn io_error(path: &Path, err: std::io::Error) -> DataStoreError {
    DataStoreError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
