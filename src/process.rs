//! The process manager: top-level driver of a run.
//!
//! A [`ProcessManager`] owns the ordered chains, the [`DataStore`] and the
//! [`ServiceRegistry`]. `run` executes chains in insertion order, writes
//! checkpoints according to [`RunSettings::checkpoints`], and returns one
//! [`RunReport`]. Independent runs in one process use separate managers.

use std::ops::Range;

use crate::chain::Chain;
use crate::config::{ConfigObject, RunSettings};
use crate::datastore::DataStore;
use crate::execution::{ChainState, RunReport};
use crate::service::{ServiceError, ServiceRegistry};
use crate::status::StatusSignal;
use crate::store::{Checkpoint, CheckpointStore, FileCheckpointStore, RunId, StoreError};

/// Errors raised while building or starting a pipeline.
///
/// Link-level failures are not errors: they end the run with a
/// [`StatusSignal::Failure`] report.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// A chain with this name already exists.
    #[error("Chain already exists: {0}")]
    DuplicateChain(String),

    /// A link with this name already exists in the chain.
    #[error("Link {link} already exists in chain {chain}")]
    DuplicateLink {
        /// Chain name.
        chain: String,
        /// Link name.
        link: String,
    },

    /// No chain with this name exists.
    #[error("No chain named {0}")]
    UnknownChain(String),

    /// The run window is empty: `end_with_chain` precedes `begin_with_chain`.
    #[error("Chain {end} comes before chain {begin}")]
    InvalidWindow {
        /// First chain of the window.
        begin: String,
        /// Last chain of the window.
        end: String,
    },

    /// The state to resume from could not be found or restored.
    #[error("Cannot resume run: {0}")]
    Resume(String),

    /// Checkpoints were requested but no checkpoint store is configured.
    #[error("Checkpoints are enabled but no checkpoint store or checkpoint_dir is configured")]
    NoCheckpointStore,

    /// Writing or reading a checkpoint failed.
    #[error(transparent)]
    Checkpoint(#[from] StoreError),

    /// Snapshotting or restoring services failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Top-level driver owning chains, data store and services.
pub struct ProcessManager {
    chains: Vec<Chain>,
    store: DataStore,
    services: ServiceRegistry,
    settings: RunSettings,
    checkpoints: Option<Box<dyn CheckpointStore>>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("chains", &self.chain_names())
            .field("store_entries", &self.store.len())
            .field("services", &self.services)
            .field("settings", &self.settings)
            .field("checkpoints", &self.checkpoints.is_some())
            .finish()
    }
}

impl ProcessManager {
    /// Create a manager with default settings and a default [`ConfigObject`].
    pub fn new() -> Self {
        Self::with_settings(RunSettings::default())
    }

    /// Create a manager with the given run settings.
    pub fn with_settings(settings: RunSettings) -> Self {
        let mut services = ServiceRegistry::new();
        services.register(ConfigObject::default());
        Self {
            chains: Vec::new(),
            store: DataStore::new(),
            services,
            settings,
            checkpoints: None,
        }
    }

    /// Use `store` for checkpoints instead of the `checkpoint_dir` default.
    pub fn with_checkpoint_store(mut self, store: impl CheckpointStore + 'static) -> Self {
        self.set_checkpoint_store(store);
        self
    }

    /// Replace the checkpoint store.
    pub fn set_checkpoint_store(&mut self, store: impl CheckpointStore + 'static) {
        self.checkpoints = Some(Box::new(store));
    }

    /// Run settings.
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Mutable run settings.
    pub fn settings_mut(&mut self) -> &mut RunSettings {
        &mut self.settings
    }

    /// The data store.
    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Mutable data store.
    pub fn store_mut(&mut self) -> &mut DataStore {
        &mut self.store
    }

    /// The service registry.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Mutable service registry.
    pub fn services_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.services
    }

    // ------------------------------------------------------------------------
    // Chains
    // ------------------------------------------------------------------------

    /// Add an empty chain named `name`.
    pub fn add_chain(&mut self, name: impl Into<String>) -> Result<&mut Chain, PipelineError> {
        self.push_chain(Chain::new(name))
    }

    /// Add an already built chain.
    pub fn push_chain(&mut self, chain: Chain) -> Result<&mut Chain, PipelineError> {
        if self.has_chain(chain.name()) {
            tracing::error!(chain = chain.name(), "pm.duplicate_chain");
            return Err(PipelineError::DuplicateChain(chain.name().to_string()));
        }
        tracing::debug!(chain = chain.name(), "pm.chain_added");
        self.chains.push(chain);
        let index = self.chains.len() - 1;
        Ok(&mut self.chains[index])
    }

    /// Get the chain named `name`.
    pub fn chain(&self, name: &str) -> Result<&Chain, PipelineError> {
        self.chains
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| PipelineError::UnknownChain(name.to_string()))
    }

    /// Get the chain named `name` mutably.
    pub fn chain_mut(&mut self, name: &str) -> Result<&mut Chain, PipelineError> {
        self.chains
            .iter_mut()
            .find(|c| c.name() == name)
            .ok_or_else(|| PipelineError::UnknownChain(name.to_string()))
    }

    /// Position of the chain named `name`.
    pub fn chain_index(&self, name: &str) -> Result<usize, PipelineError> {
        self.chains
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| PipelineError::UnknownChain(name.to_string()))
    }

    /// Check whether a chain named `name` exists.
    pub fn has_chain(&self, name: &str) -> bool {
        self.chains.iter().any(|c| c.name() == name)
    }

    /// Names of the chains, in run order.
    pub fn chain_names(&self) -> Vec<&str> {
        self.chains.iter().map(Chain::name).collect()
    }

    /// Remove the chain named `name`; a missing chain is only logged.
    pub fn remove_chain(&mut self, name: &str) {
        match self.chains.iter().position(|c| c.name() == name) {
            Some(index) => {
                self.chains.remove(index);
            }
            None => tracing::warn!(chain = name, "pm.remove_missing_chain"),
        }
    }

    /// Remove every chain.
    pub fn remove_chains(&mut self) {
        self.chains.clear();
    }

    /// Clear all owned state: chains, data store and services.
    ///
    /// Services are released. Settings and the checkpoint store are kept; a
    /// fresh default [`ConfigObject`] is registered.
    pub fn reset(&mut self) {
        tracing::debug!("pm.reset");
        self.remove_chains();
        self.store.clear();
        self.services.shutdown();
        self.services.register(ConfigObject::default());
    }

    /// Log chains, links and services of the upcoming run.
    pub fn log_summary(&self) {
        tracing::info!(
            chains = self.chains.len(),
            services = self.services.len(),
            begin = self.settings.begin_with_chain.as_deref().unwrap_or_default(),
            end = self.settings.end_with_chain.as_deref().unwrap_or_default(),
            "pm.summary"
        );
        for name in self.services.names() {
            tracing::debug!(service = name, "pm.service");
        }
        for chain in &self.chains {
            chain.log_summary();
        }
    }

    // ------------------------------------------------------------------------
    // Run
    // ------------------------------------------------------------------------

    /// Run the chains.
    ///
    /// Returns `Err` only when the run cannot start or a checkpoint cannot be
    /// written; link and chain failures yield a report with
    /// [`StatusSignal::Failure`]. Taking `&mut self` makes runs single-flight.
    ///
    /// After a successful run every service is released, then the run's
    /// [`ConfigObject`] is registered again so the next run sees the same
    /// configuration.
    pub async fn run(&mut self) -> Result<RunReport, PipelineError> {
        let run_id = RunId::new();
        let mut report = RunReport::new(run_id);
        tracing::info!(run = %run_id, "pm.run.start");

        let window = self.window()?;
        if self.settings.persistence_enabled() {
            self.ensure_checkpoint_store()?;
        }
        let start = self.prepare(&window, &mut report).await?;
        for chain in &mut self.chains {
            chain.reset_state();
        }
        self.log_summary();
        if let Ok(config) = self.services.get::<ConfigObject>() {
            config.log_summary();
        }

        for index in start..window.end {
            let is_last = index + 1 == window.end;
            let chain = &mut self.chains[index];
            let outcome = chain
                .run(&mut self.store, &mut self.services, self.settings.max_repeats)
                .await;
            let state = outcome.record.state;
            let chain_name = outcome.record.name.clone();
            report.chains.push(outcome.record);

            match state {
                ChainState::Aborted => {
                    report.fault = outcome.fault;
                    report.finish(StatusSignal::Failure);
                    tracing::error!(
                        run = %run_id,
                        chain = %chain_name,
                        fault = ?report.fault.as_ref().map(|f| f.to_string()),
                        "pm.run.failed"
                    );
                    return Ok(report);
                }
                ChainState::Skipped => continue,
                _ => {}
            }

            if self.settings.checkpoints.applies_to(&chain_name, is_last) {
                self.checkpoint(run_id, &chain_name).await?;
                report.checkpoints.push(chain_name);
            }
        }

        let config = self
            .services
            .get::<ConfigObject>()
            .map(|config| config.clone())
            .unwrap_or_default();
        self.services.shutdown();
        self.services.register(config);
        report.finish(StatusSignal::Success);
        tracing::info!(
            run = %run_id,
            chains = report.chains.len(),
            duration_ms = report.duration_ms().unwrap_or_default(),
            "pm.run.completed"
        );
        Ok(report)
    }

    /// Chains covered by `begin_with_chain` / `end_with_chain`.
    fn window(&self) -> Result<Range<usize>, PipelineError> {
        let begin = match &self.settings.begin_with_chain {
            Some(name) => self.chain_index(name)?,
            None => 0,
        };
        let end = match &self.settings.end_with_chain {
            Some(name) => self.chain_index(name)? + 1,
            None => self.chains.len(),
        };
        if end <= begin && begin < self.chains.len() {
            return Err(PipelineError::InvalidWindow {
                begin: self.chains[begin].name().to_string(),
                end: self.chains[end - 1].name().to_string(),
            });
        }
        Ok(begin..end)
    }

    /// Reset or restore run state; returns the index of the first chain to run.
    async fn prepare(
        &mut self,
        window: &Range<usize>,
        report: &mut RunReport,
    ) -> Result<usize, PipelineError> {
        if self.settings.resume_from_latest {
            self.ensure_checkpoint_store()?;
            let checkpoint = self
                .checkpoint_store()?
                .latest()
                .await?
                .ok_or_else(|| PipelineError::Resume("no checkpoint to resume from".into()))?;
            let index = self.chain_index(&checkpoint.chain).map_err(|_| {
                PipelineError::Resume(format!(
                    "checkpointed chain {} is not configured",
                    checkpoint.chain
                ))
            })?;
            self.restore(checkpoint, report)?;
            return Ok(index + 1);
        }

        if window.start == 0 {
            self.store.clear();
            return Ok(0);
        }

        // Chains between the nearest earlier checkpoint and the window are
        // replayed so their effects are present.
        self.ensure_checkpoint_store()?;
        let mut found = None;
        {
            let store = self.checkpoint_store()?;
            for index in (0..window.start).rev() {
                let name = self.chains[index].name();
                if store.exists(name).await? {
                    found = Some((index, store.get(name).await?));
                    break;
                }
            }
        }
        match found {
            Some((index, checkpoint)) => {
                if index + 1 < window.start {
                    tracing::info!(
                        from = self.chains[index + 1].name(),
                        to = self.chains[window.start].name(),
                        "pm.resume.replay"
                    );
                }
                self.restore(checkpoint, report)?;
                Ok(index + 1)
            }
            None => Err(PipelineError::Resume(format!(
                "no checkpoint found before chain {}",
                self.chains[window.start].name()
            ))),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint, report: &mut RunReport) -> Result<(), PipelineError> {
        tracing::info!(
            chain = %checkpoint.chain,
            from_run = %checkpoint.run_id,
            entries = checkpoint.data_store.len(),
            services = checkpoint.services.len(),
            "pm.resume"
        );
        self.services.restore_snapshot(checkpoint.services)?;
        self.store = checkpoint.data_store;
        report.resumed_after = Some(checkpoint.chain);
        Ok(())
    }

    async fn checkpoint(&mut self, run_id: RunId, chain: &str) -> Result<(), PipelineError> {
        let services = self.services.snapshot()?;
        let checkpoint = Checkpoint::new(run_id, chain, self.store.clone(), services);
        self.ensure_checkpoint_store()?;
        self.checkpoint_store()?.save(checkpoint).await?;
        tracing::info!(run = %run_id, chain, entries = self.store.len(), "checkpoint.saved");
        Ok(())
    }

    fn ensure_checkpoint_store(&mut self) -> Result<(), PipelineError> {
        if self.checkpoints.is_none() {
            let dir = self
                .settings
                .checkpoint_dir
                .clone()
                .ok_or(PipelineError::NoCheckpointStore)?;
            self.checkpoints = Some(Box::new(FileCheckpointStore::new(dir)));
        }
        Ok(())
    }

    fn checkpoint_store(&self) -> Result<&dyn CheckpointStore, PipelineError> {
        self.checkpoints
            .as_deref()
            .ok_or(PipelineError::NoCheckpointStore)
    }
}
