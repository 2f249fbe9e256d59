//! Run configuration.
//!
//! - [`ConfigObject`]: persistable service with analysis-wide settings that
//!   links read and write during a run.
//! - [`RunSettings`]: run-control options of the process manager, loaded
//!   from TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while loading configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {reason}")]
    Read {
        /// Config file path.
        path: String,
        /// Underlying I/O message.
        reason: String,
    },

    /// The configuration text is not valid.
    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Analysis-wide settings shared by all links.
///
/// Persisted with every checkpoint, so a resumed run sees the settings the
/// interrupted run had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigObject {
    /// Name of the analysis, used for bookkeeping.
    pub analysis_name: String,
    /// Analysis version.
    pub version: u32,
    /// Seed for random generators.
    pub seed: u64,
    /// Base directory for results.
    pub results_dir: PathBuf,
    /// Free-form settings.
    pub settings: BTreeMap<String, Value>,
}

impl Default for ConfigObject {
    fn default() -> Self {
        Self {
            analysis_name: "default".into(),
            version: 0,
            seed: 0,
            results_dir: PathBuf::from("results"),
            settings: BTreeMap::new(),
        }
    }
}

crate::persistent_service!(ConfigObject, "config");

impl ConfigObject {
    /// Parse a config object from TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        parse_toml(text)
    }

    /// Get the raw setting under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Get the setting under `key` decoded as `T`.
    ///
    /// Returns `None` if the key is absent or holds another type.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .and_then(|v| T::deserialize(v).ok())
    }

    /// Set a setting, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.settings.insert(key.into(), value.into())
    }

    /// Remove a setting.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.settings.remove(key)
    }

    /// Truthiness of a setting: absent, `null`, `false`, `0` and empty
    /// strings/collections are false.
    pub fn flag(&self, key: &str) -> bool {
        match self.settings.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }

    /// Log every setting.
    pub fn log_summary(&self) {
        tracing::info!(
            analysis = %self.analysis_name,
            version = self.version,
            seed = self.seed,
            results_dir = %self.results_dir.display(),
            settings = self.settings.len(),
            "config.summary"
        );
        for (key, value) in &self.settings {
            tracing::debug!(key = %key, value = %value, "config.setting");
        }
    }
}

/// When the process manager writes checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Never write checkpoints.
    #[default]
    Never,
    /// Checkpoint after every completed chain.
    EachChain,
    /// Checkpoint only after the last chain of the run window.
    LastChain,
    /// Checkpoint only after the named chain.
    OneChain(String),
}

impl CheckpointPolicy {
    /// Whether a checkpoint is due after `chain`.
    pub fn applies_to(&self, chain: &str, is_last: bool) -> bool {
        match self {
            Self::Never => false,
            Self::EachChain => true,
            Self::LastChain => is_last,
            Self::OneChain(name) => name == chain,
        }
    }
}

/// Run-control options of the process manager.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Start the run at this chain, restoring state from the closest earlier
    /// checkpoint.
    pub begin_with_chain: Option<String>,
    /// Stop the run after this chain.
    pub end_with_chain: Option<String>,
    /// Restore the latest checkpoint and start at the chain following it.
    pub resume_from_latest: bool,
    /// When to write checkpoints.
    pub checkpoints: CheckpointPolicy,
    /// Directory for file checkpoints, used when no checkpoint store is set.
    pub checkpoint_dir: Option<PathBuf>,
    /// Default cap on chain repeats; `None` leaves repeats unbounded.
    pub max_repeats: Option<u64>,
}

impl RunSettings {
    /// Parse run settings from TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        parse_toml(text)
    }

    /// Load run settings from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let settings = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "settings.loaded");
        Ok(settings)
    }

    /// Whether any checkpoint can be written during the run.
    pub fn persistence_enabled(&self) -> bool {
        self.checkpoints != CheckpointPolicy::Never
    }
}

fn parse_toml<T: DeserializeOwned>(text: &str) -> Result<T, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
}
