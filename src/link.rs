//! Link trait: the unit of work of a pipeline.
//!
//! A `Link` goes through a three-phase lifecycle driven by its owning chain:
//! - `initialize`: validate the link's own configuration; never touches the store
//! - `execute`: read inputs from the data store, compute, write outputs
//! - `finalize`: release link-local resources; runs on every exit path

use serde::{de::DeserializeOwned, Serialize};

use crate::config::ConfigObject;
use crate::datastore::{Artifact, DataStore, DataStoreError};
use crate::service::{Service, ServiceError, ServiceRegistry};
use crate::status::StatusSignal;

/// Result of a link phase.
pub type LinkResult = Result<StatusSignal, LinkError>;

/// Errors a link phase can raise.
///
/// Any error is observed by the chain as a [`StatusSignal::Failure`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// Invalid or missing configuration attribute.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A data store precondition was violated.
    #[error(transparent)]
    DataStore(#[from] DataStoreError),

    /// A required service is unavailable.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Link-declared business failure.
    #[error("{0}")]
    Failed(String),
}

impl LinkError {
    /// Shorthand for [`LinkError::Configuration`].
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for [`LinkError::Failed`].
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Lifecycle phase of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    /// `initialize()`.
    Initialize,
    /// `execute()`.
    Execute,
    /// `finalize()`.
    Finalize,
}

impl Phase {
    /// Lowercase label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Execute => "execute",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a link sees while executing: the shared store and services.
pub struct LinkContext<'a> {
    store: &'a mut DataStore,
    services: &'a mut ServiceRegistry,
    chain: &'a str,
    link: &'a str,
    pass: u64,
}

impl<'a> LinkContext<'a> {
    /// Build a context for `link` of `chain` on execute pass `pass` (1-based).
    pub fn new(
        store: &'a mut DataStore,
        services: &'a mut ServiceRegistry,
        chain: &'a str,
        link: &'a str,
        pass: u64,
    ) -> Self {
        Self {
            store,
            services,
            chain,
            link,
            pass,
        }
    }

    /// The shared data store.
    pub fn store(&mut self) -> &mut DataStore {
        &mut *self.store
    }

    /// Read-only view of the data store.
    pub fn store_ref(&self) -> &DataStore {
        &*self.store
    }

    /// The service registry.
    pub fn services(&mut self) -> &mut ServiceRegistry {
        &mut *self.services
    }

    /// Name of the executing chain.
    pub fn chain_name(&self) -> &str {
        self.chain
    }

    /// Name of the executing link.
    pub fn link_name(&self) -> &str {
        self.link
    }

    /// Execute pass of the chain, starting at 1 and growing with each repeat.
    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Read the artifact under `key` as `T`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<T, LinkError> {
        Ok(self.store.get_as(key)?)
    }

    /// Read the raw artifact under `key`.
    pub fn load_value(&self, key: &str) -> Result<&Artifact, LinkError> {
        Ok(self.store.get(key)?)
    }

    /// Write `value` under `key`, overwriting any earlier artifact.
    pub fn save<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), LinkError> {
        self.store.set(key, value)?;
        tracing::debug!(chain = self.chain, link = self.link, key, "datastore.set");
        Ok(())
    }

    /// Look up a registered service.
    pub fn service<T: Service>(&mut self) -> Result<&mut T, LinkError> {
        Ok(self.services.get::<T>()?)
    }

    /// Look up a service, constructing it with `factory` on first use.
    pub fn service_or_create<T, F>(&mut self, factory: F) -> Result<&mut T, LinkError>
    where
        T: Service,
        F: FnOnce() -> T,
    {
        Ok(self.services.get_or_create(factory)?)
    }

    /// The run's [`ConfigObject`], created with defaults if absent.
    pub fn config(&mut self) -> Result<&mut ConfigObject, LinkError> {
        Ok(self.services.get_or_default::<ConfigObject>()?)
    }
}

/// A unit of pipeline logic.
///
/// Implementations hold their configuration as plain fields, validate it in
/// `initialize`, and exchange data with other links only through the
/// [`LinkContext`]. `execute` must tolerate being called again when its chain
/// repeats.
#[async_trait::async_trait]
pub trait Link: Send + Sync {
    /// Name of the link, unique within its chain.
    fn name(&self) -> &str;

    /// Data store keys that must exist before `execute` runs.
    fn reads(&self) -> Vec<String> {
        Vec::new()
    }

    /// Data store keys this link writes.
    fn writes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Signal to return, instead of executing, when a key from
    /// [`Link::reads`] is missing.
    ///
    /// `Failure` (the default) fails the run with `KeyNotFound`; `SkipChain`
    /// tolerates the absence by skipping the rest of the chain.
    fn on_missing_input(&self) -> StatusSignal {
        StatusSignal::Failure
    }

    /// Validate configuration and derive defaults.
    async fn initialize(&mut self) -> LinkResult {
        Ok(StatusSignal::Success)
    }

    /// Perform the link's work.
    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult;

    /// Release link-local resources.
    async fn finalize(&mut self) -> LinkResult {
        Ok(StatusSignal::Success)
    }
}

/// Closure-backed link for ad-hoc pipelines.
///
/// ```
/// use catena::{FnLink, StatusSignal};
///
/// let link = FnLink::new("double", |ctx| {
///     let n: i64 = ctx.load("n")?;
///     ctx.save("n", n * 2)?;
///     Ok(StatusSignal::Success)
/// })
/// .reading(["n"])
/// .writing(["n"]);
/// ```
pub struct FnLink<F> {
    name: String,
    reads: Vec<String>,
    writes: Vec<String>,
    if_input_missing: StatusSignal,
    func: F,
}

impl<F> FnLink<F> {
    /// Create a link running `func` on every execute.
    pub fn new(name: impl Into<String>, func: F) -> Self
    where
        F: FnMut(&mut LinkContext<'_>) -> LinkResult + Send + Sync,
    {
        Self {
            name: name.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            if_input_missing: StatusSignal::Failure,
            func,
        }
    }

    /// Declare the keys this link requires.
    pub fn reading<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the keys this link produces.
    pub fn writing<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Signal returned when a declared input is missing.
    pub fn if_input_missing(mut self, signal: StatusSignal) -> Self {
        self.if_input_missing = signal;
        self
    }
}

#[async_trait::async_trait]
impl<F> Link for FnLink<F>
where
    F: FnMut(&mut LinkContext<'_>) -> LinkResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn reads(&self) -> Vec<String> {
        self.reads.clone()
    }

    fn writes(&self) -> Vec<String> {
        self.writes.clone()
    }

    fn on_missing_input(&self) -> StatusSignal {
        self.if_input_missing
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        (self.func)(ctx)
    }
}
