//! Checkpoint storage for resumable runs.
//!
//! A [`Checkpoint`] is one blob holding the full data store, the persistable
//! services and the name of the chain after which it was taken. Stores keep
//! one checkpoint per chain plus a pointer to the most recent one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::datastore::DataStore;

/// Get the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a run ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Errors that can occur during checkpoint storage operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No checkpoint exists for the chain.
    #[error("Checkpoint not found for chain: {0}")]
    NotFound(String),

    /// A storage backend error occurred.
    #[error("Storage error: {0}")]
    Backend(String),

    /// A checkpoint could not be encoded or decoded.
    #[error("Checkpoint codec error: {0}")]
    Codec(String),
}

/// Snapshot of a run taken after a chain completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The run that wrote the checkpoint.
    pub run_id: RunId,
    /// The last successfully completed chain.
    pub chain: String,
    /// The full data store.
    pub data_store: DataStore,
    /// States of the persistable services, by service name.
    pub services: BTreeMap<String, Value>,
    /// When the checkpoint was taken (Unix millis).
    pub saved_at: u64,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time.
    pub fn new(
        run_id: RunId,
        chain: impl Into<String>,
        data_store: DataStore,
        services: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            run_id,
            chain: chain.into(),
            data_store,
            services,
            saved_at: now_millis(),
        }
    }
}

/// Storage backend for checkpoints.
///
/// Implementations must be thread-safe (`Send + Sync`).
/// Methods are async to support both sync and async backends.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Save a checkpoint, replacing any earlier one for the same chain, and
    /// mark it as the latest.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), StoreError>;

    /// Get the checkpoint taken after `chain`.
    async fn get(&self, chain: &str) -> Result<Checkpoint, StoreError>;

    /// Get the most recently saved checkpoint, if any.
    async fn latest(&self) -> Result<Option<Checkpoint>, StoreError>;

    /// Delete the checkpoint taken after `chain`.
    async fn delete(&self, chain: &str) -> Result<(), StoreError>;

    /// Check if a checkpoint exists for `chain`.
    async fn exists(&self, chain: &str) -> Result<bool, StoreError>;
}

/// Lets several process managers share one store.
#[async_trait::async_trait]
impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        (**self).save(checkpoint).await
    }

    async fn get(&self, chain: &str) -> Result<Checkpoint, StoreError> {
        (**self).get(chain).await
    }

    async fn latest(&self) -> Result<Option<Checkpoint>, StoreError> {
        (**self).latest().await
    }

    async fn delete(&self, chain: &str) -> Result<(), StoreError> {
        (**self).delete(chain).await
    }

    async fn exists(&self, chain: &str) -> Result<bool, StoreError> {
        (**self).exists(chain).await
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// In-memory checkpoint store for testing and single-process use.
///
/// Uses `parking_lot::RwLock` for thread-safe access.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<String, Checkpoint>>,
    latest: RwLock<Option<String>>,
}

impl InMemoryCheckpointStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let chain = checkpoint.chain.clone();
        self.records.write().insert(chain.clone(), checkpoint);
        *self.latest.write() = Some(chain);
        Ok(())
    }

    async fn get(&self, chain: &str) -> Result<Checkpoint, StoreError> {
        self.records
            .read()
            .get(chain)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(chain.to_string()))
    }

    async fn latest(&self) -> Result<Option<Checkpoint>, StoreError> {
        let latest = self.latest.read().clone();
        Ok(latest.and_then(|chain| self.records.read().get(&chain).cloned()))
    }

    async fn delete(&self, chain: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .remove(chain)
            .ok_or_else(|| StoreError::NotFound(chain.to_string()))?;
        let mut latest = self.latest.write();
        if latest.as_deref() == Some(chain) {
            *latest = None;
        }
        Ok(())
    }

    async fn exists(&self, chain: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().contains_key(chain))
    }
}

// ============================================================================
// File Store
// ============================================================================

const LATEST_FILE: &str = "LATEST";

/// Checkpoint store writing one JSON file per chain into a directory.
///
/// The file `LATEST` holds the name of the most recently checkpointed chain.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for `chain`.
    pub fn path_for(&self, chain: &str) -> PathBuf {
        self.dir.join(format!("chain_{}.json", encode_name(chain)))
    }

    fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(backend_error)?;
        let bytes =
            serde_json::to_vec_pretty(&checkpoint).map_err(|e| StoreError::Codec(e.to_string()))?;
        let path = self.path_for(&checkpoint.chain);
        tokio::fs::write(&path, bytes).await.map_err(backend_error)?;
        tokio::fs::write(self.latest_path(), checkpoint.chain.as_bytes())
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn get(&self, chain: &str) -> Result<Checkpoint, StoreError> {
        let bytes = match tokio::fs::read(self.path_for(chain)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(chain.to_string()))
            }
            Err(e) => return Err(backend_error(e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }

    async fn latest(&self) -> Result<Option<Checkpoint>, StoreError> {
        let chain = match tokio::fs::read_to_string(self.latest_path()).await {
            Ok(chain) => chain,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(backend_error(e)),
        };
        match self.get(&chain).await {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, chain: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(chain)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(chain.to_string()))
            }
            Err(e) => return Err(backend_error(e)),
        }
        if let Ok(latest) = tokio::fs::read_to_string(self.latest_path()).await {
            if latest == chain {
                tokio::fs::remove_file(self.latest_path())
                    .await
                    .map_err(backend_error)?;
            }
        }
        Ok(())
    }

    async fn exists(&self, chain: &str) -> Result<bool, StoreError> {
        tokio::fs::try_exists(self.path_for(chain))
            .await
            .map_err(backend_error)
    }
}

/// Percent-encode everything but ASCII alphanumerics, `-` and `_`, so that
/// distinct chain names map to distinct file names.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn backend_error(err: std::io::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
