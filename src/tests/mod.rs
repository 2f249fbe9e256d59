//! Scenario tests for pipelines run through the process manager.
//!
//! ## Test Organization
//!
//! - `common`: Scripted links, a journal of lifecycle calls and a
//!   persistable counter service
//! - `basic`: All-success runs, ordering and pipeline construction
//! - `control`: Failure, skip, repeat and abort handling
//! - `services`: Service lookup, registration and shutdown
//! - `persistence`: Checkpoints, resume and run windows
//! - `ops`: Built-in links inside running chains

mod common;

mod ops;
mod persistence;
