#![deny(missing_docs)]

//! Catena: sequential chain/link pipelines with a shared data store.
//!
//! # Core Concepts
//!
//! - [`Link`]: a unit of work with an `initialize` / `execute` / `finalize`
//!   lifecycle, returning a [`StatusSignal`]
//! - [`Chain`]: an ordered group of links run under one repeat/skip/abort policy
//! - [`ProcessManager`]: runs chains in order, owns the [`DataStore`] and the
//!   [`ServiceRegistry`], and checkpoints both so a run can resume
//!
//! Links talk to each other only through the data store; long-lived shared
//! resources (the run's [`ConfigObject`], engine handles) live in the
//! service registry.
//!
//! ```
//! use catena::{FnLink, ProcessManager, StatusSignal};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), catena::PipelineError> {
//! let mut pm = ProcessManager::new();
//! pm.add_chain("Ingest")?.add_link(FnLink::new("reader", |ctx| {
//!     ctx.save("raw", vec![3, 1, 2])?;
//!     Ok(StatusSignal::Success)
//! }))?;
//! pm.add_chain("Transform")?.add_link(
//!     FnLink::new("sorter", |ctx| {
//!         let mut rows: Vec<i64> = ctx.load("raw")?;
//!         rows.sort();
//!         ctx.save("clean", rows)?;
//!         Ok(StatusSignal::Success)
//!     })
//!     .reading(["raw"]),
//! )?;
//!
//! let report = pm.run().await?;
//! assert!(report.is_success());
//! assert_eq!(pm.store().get_as::<Vec<i64>>("clean").ok(), Some(vec![1, 2, 3]));
//! # Ok(())
//! # }
//! ```

pub use serde_json;

pub mod chain;
pub mod config;
pub mod datastore;
pub mod execution;
pub mod link;
pub mod logging;
mod macros;
pub mod ops;
pub mod process;
pub mod service;
pub mod status;
pub mod store;

pub use chain::{Chain, ChainOutcome};
pub use config::{CheckpointPolicy, ConfigError, ConfigObject, RunSettings};
pub use datastore::{Artifact, DataStore, DataStoreError};
pub use execution::{ChainRecord, ChainState, Fault, LinkRecord, RunReport};
pub use link::{FnLink, Link, LinkContext, LinkError, LinkResult, Phase};
pub use ops::{
    AssertInStore, BreakLink, CopyInStore, DeleteFromStore, PrintStore, RepeatChain,
    SkipChainIfEmpty,
};
pub use process::{PipelineError, ProcessManager};
pub use service::{Service, ServiceError, ServiceRegistry};
pub use status::StatusSignal;
pub use store::{
    Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, RunId, StoreError,
};

#[cfg(test)]
mod tests;
