//! Built-in links for chain control and data store housekeeping.
//!
//! Each link is configured through plain fields with documented defaults;
//! `initialize` rejects invalid combinations with
//! [`LinkError::Configuration`].

use serde_json::Value;

use crate::datastore::{kind_of, Artifact, DataStoreError};
use crate::link::{Link, LinkContext, LinkError, LinkResult};
use crate::status::StatusSignal;

// ============================================================================
// Chain control
// ============================================================================

/// Repeats its chain while a config flag is set or a repeat budget remains.
///
/// Returns [`StatusSignal::Repeat`] when any setting named in `listen_to` is
/// truthy in the run's config object. Otherwise, while fewer than
/// `max_count` repeats have been requested, returns `Repeat` and counts it.
/// Returns `Success` once neither applies.
#[derive(Debug, Clone)]
pub struct RepeatChain {
    name: String,
    /// Number of repeats to request; `None` disables counting.
    pub max_count: Option<u64>,
    /// Config flags that keep the chain repeating while set.
    pub listen_to: Vec<String>,
    count: u64,
}

impl RepeatChain {
    /// Create a link that never repeats until configured.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_count: None,
            listen_to: Vec::new(),
            count: 0,
        }
    }

    /// Request `max_count` repeats.
    pub fn max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Repeat while the config flag `flag` is set.
    pub fn listen_to(mut self, flag: impl Into<String>) -> Self {
        self.listen_to.push(flag.into());
        self
    }

    /// Repeats requested so far in the current chain run.
    pub fn count(&self) -> u64 {
        self.count
    }
}

#[async_trait::async_trait]
impl Link for RepeatChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self) -> LinkResult {
        if self.listen_to.iter().any(String::is_empty) {
            return Err(LinkError::configuration("listen_to contains an empty flag name"));
        }
        self.count = 0;
        Ok(StatusSignal::Success)
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        if !self.listen_to.is_empty() {
            let config = ctx.config()?;
            if let Some(flag) = self.listen_to.iter().find(|f| config.flag(f)) {
                tracing::debug!(link = %self.name, flag = %flag, "repeat.flag_set");
                return Ok(StatusSignal::Repeat);
            }
        }
        match self.max_count {
            Some(max) if self.count < max => {
                self.count += 1;
                tracing::debug!(link = %self.name, count = self.count, max, "repeat.counted");
                Ok(StatusSignal::Repeat)
            }
            _ => Ok(StatusSignal::Success),
        }
    }
}

/// Stops the run with [`StatusSignal::Failure`] when reached.
#[derive(Debug, Clone)]
pub struct BreakLink {
    name: String,
}

impl BreakLink {
    /// Create a break point.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl Link for BreakLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        tracing::warn!(chain = ctx.chain_name(), link = %self.name, "break.reached");
        Ok(StatusSignal::Failure)
    }
}

/// Skips the rest of the chain when an artifact is empty.
///
/// An artifact is empty when it is `null` or an empty array, object or
/// string. A missing key skips the chain when `skip_when_missing` is set
/// (the default); otherwise it fails with `KeyNotFound`.
#[derive(Debug, Clone)]
pub struct SkipChainIfEmpty {
    name: String,
    /// Keys to inspect.
    pub keys: Vec<String>,
    /// Treat a missing key as empty. Default `true`.
    pub skip_when_missing: bool,
}

impl SkipChainIfEmpty {
    /// Create a link inspecting `keys`.
    pub fn new<I, S>(name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            skip_when_missing: true,
        }
    }

    /// Set whether a missing key skips the chain.
    pub fn skip_when_missing(mut self, skip: bool) -> Self {
        self.skip_when_missing = skip;
        self
    }
}

fn is_empty_artifact(value: &Artifact) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[async_trait::async_trait]
impl Link for SkipChainIfEmpty {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self) -> LinkResult {
        if self.keys.is_empty() {
            return Err(LinkError::configuration("no keys to inspect"));
        }
        Ok(StatusSignal::Success)
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        let store = ctx.store_ref();
        for key in &self.keys {
            let empty = match store.get(key) {
                Ok(value) => is_empty_artifact(value),
                Err(_) if self.skip_when_missing => true,
                Err(e) => return Err(e.into()),
            };
            if empty {
                tracing::info!(chain = ctx.chain_name(), link = %self.name, key = %key, "skip.empty");
                return Ok(StatusSignal::SkipChain);
            }
        }
        Ok(StatusSignal::Success)
    }
}

// ============================================================================
// Data store housekeeping
// ============================================================================

/// Fails with `KeyNotFound` unless every listed key is present.
#[derive(Debug, Clone)]
pub struct AssertInStore {
    name: String,
    /// Keys that must exist.
    pub keys: Vec<String>,
}

impl AssertInStore {
    /// Create an assertion over `keys`.
    pub fn new<I, S>(name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait::async_trait]
impl Link for AssertInStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self) -> LinkResult {
        if self.keys.is_empty() {
            return Err(LinkError::configuration("no keys to assert"));
        }
        Ok(StatusSignal::Success)
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        match self.keys.iter().find(|k| !ctx.store_ref().contains(k)) {
            Some(key) => Err(DataStoreError::KeyNotFound(key.clone()).into()),
            None => Ok(StatusSignal::Success),
        }
    }
}

/// Removes artifacts from the data store.
///
/// `clear_all` wins over `keep_only`, which wins over `delete`. Deleting an
/// absent key is not an error.
#[derive(Debug, Clone, Default)]
pub struct DeleteFromStore {
    name: String,
    /// Keys to remove.
    pub delete: Vec<String>,
    /// When non-empty, remove every key not listed here.
    pub keep_only: Vec<String>,
    /// Remove everything.
    pub clear_all: bool,
}

impl DeleteFromStore {
    /// Create a link that deletes nothing until configured.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Remove `keys`.
    pub fn delete<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delete = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only `keys`.
    pub fn keep_only<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_only = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Clear the whole store.
    pub fn clear_all(mut self) -> Self {
        self.clear_all = true;
        self
    }
}

#[async_trait::async_trait]
impl Link for DeleteFromStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self) -> LinkResult {
        if !self.clear_all && self.keep_only.is_empty() && self.delete.is_empty() {
            return Err(LinkError::configuration(
                "set one of delete, keep_only or clear_all",
            ));
        }
        Ok(StatusSignal::Success)
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        let store = ctx.store();
        if self.clear_all {
            store.clear();
        } else if !self.keep_only.is_empty() {
            let keep = &self.keep_only;
            store.retain(|k| keep.iter().any(|kept| kept == k));
        } else {
            for key in &self.delete {
                if store.remove(key).is_none() {
                    tracing::debug!(link = %self.name, key = %key, "delete.absent");
                }
            }
        }
        tracing::debug!(link = %self.name, remaining = store.len(), "delete.done");
        Ok(StatusSignal::Success)
    }
}

/// Copies (or moves) one artifact to another key.
///
/// `store_key` defaults to `"<read_key>_copy"` when left empty.
#[derive(Debug, Clone)]
pub struct CopyInStore {
    name: String,
    /// Source key.
    pub read_key: String,
    /// Destination key.
    pub store_key: String,
    /// Remove the source after copying.
    pub move_value: bool,
}

impl CopyInStore {
    /// Copy `read_key` to the default destination.
    pub fn new(name: impl Into<String>, read_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_key: read_key.into(),
            store_key: String::new(),
            move_value: false,
        }
    }

    /// Destination key.
    pub fn store_key(mut self, key: impl Into<String>) -> Self {
        self.store_key = key.into();
        self
    }

    /// Remove the source after copying.
    pub fn move_value(mut self) -> Self {
        self.move_value = true;
        self
    }
}

#[async_trait::async_trait]
impl Link for CopyInStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn reads(&self) -> Vec<String> {
        vec![self.read_key.clone()]
    }

    fn writes(&self) -> Vec<String> {
        vec![self.store_key.clone()]
    }

    async fn initialize(&mut self) -> LinkResult {
        if self.read_key.is_empty() {
            return Err(LinkError::configuration("read_key is not set"));
        }
        if self.store_key.is_empty() {
            self.store_key = format!("{}_copy", self.read_key);
        }
        if self.store_key == self.read_key {
            return Err(LinkError::configuration(format!(
                "store_key equals read_key ({})",
                self.read_key
            )));
        }
        Ok(StatusSignal::Success)
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        let store = ctx.store();
        let value = if self.move_value {
            store
                .remove(&self.read_key)
                .ok_or_else(|| DataStoreError::KeyNotFound(self.read_key.clone()))?
        } else {
            store.get(&self.read_key)?.clone()
        };
        store.set_value(self.store_key.clone(), value);
        Ok(StatusSignal::Success)
    }
}

/// Logs the data store, or only `keys` when given.
#[derive(Debug, Clone)]
pub struct PrintStore {
    name: String,
    /// Keys to log; empty logs every entry.
    pub keys: Vec<String>,
}

impl PrintStore {
    /// Log every entry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
        }
    }

    /// Log only `keys`.
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait::async_trait]
impl Link for PrintStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        let store = ctx.store_ref();
        if self.keys.is_empty() {
            store.log_summary();
            return Ok(StatusSignal::Success);
        }
        for key in &self.keys {
            match store.get(key) {
                Ok(value) => tracing::info!(key = %key, kind = kind_of(value), value = %value, "datastore.entry"),
                Err(_) => tracing::warn!(key = %key, "datastore.missing"),
            }
        }
        Ok(StatusSignal::Success)
    }
}
