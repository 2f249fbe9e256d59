//! Common links and services for tests.
//!
//! This module contains:
//! - `Journal`: ordered log of lifecycle calls shared by scripted links
//! - `Scripted`: a link returning scripted signals and counting its calls
//! - `Tally`: a persistable service counting rows, with a release counter

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Link, LinkContext, LinkError, LinkResult, Service, StatusSignal};

// ============================================================================
// Journal
// ============================================================================

/// Ordered record of `"<link>.<phase>"` entries.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Entries for one phase, without the phase suffix.
    pub fn phase(&self, phase: &str) -> Vec<String> {
        let suffix = format!(".{}", phase);
        self.0
            .lock()
            .iter()
            .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }
}

// ============================================================================
// Scripted
// ============================================================================

/// Call counters of a scripted link, shared with the test after the link is moved
/// into its chain.
#[derive(Clone, Default)]
pub struct Calls {
    initialize: Arc<AtomicUsize>,
    execute: Arc<AtomicUsize>,
    finalize: Arc<AtomicUsize>,
}

impl Calls {
    pub fn initialized(&self) -> usize {
        self.initialize.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.execute.load(Ordering::SeqCst)
    }

    pub fn finalized(&self) -> usize {
        self.finalize.load(Ordering::SeqCst)
    }
}

/// Link returning scripted signals.
///
/// `execute` returns the queued signals in order, then `Success`. When
/// `writes` is set it stores its execution count under that key.
pub struct Scripted {
    name: String,
    journal: Journal,
    calls: Calls,
    script: VecDeque<LinkResult>,
    on_initialize: LinkResult,
    on_finalize: LinkResult,
    reads: Vec<String>,
    writes: Option<String>,
    if_input_missing: StatusSignal,
}

impl Scripted {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            calls: Calls::default(),
            script: VecDeque::new(),
            on_initialize: Ok(StatusSignal::Success),
            on_finalize: Ok(StatusSignal::Success),
            reads: Vec::new(),
            writes: None,
            if_input_missing: StatusSignal::Failure,
        }
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }

    pub fn then(mut self, signal: StatusSignal) -> Self {
        self.script.push_back(Ok(signal));
        self
    }

    pub fn then_err(mut self, err: LinkError) -> Self {
        self.script.push_back(Err(err));
        self
    }

    /// Return `signal` on every execute.
    pub fn always(mut self, signal: StatusSignal, times: usize) -> Self {
        self.script.extend((0..times).map(|_| Ok(signal)));
        self
    }

    pub fn on_initialize(mut self, result: LinkResult) -> Self {
        self.on_initialize = result;
        self
    }

    pub fn on_finalize(mut self, result: LinkResult) -> Self {
        self.on_finalize = result;
        self
    }

    pub fn reading(mut self, key: &str) -> Self {
        self.reads.push(key.to_string());
        self
    }

    pub fn writing(mut self, key: &str) -> Self {
        self.writes = Some(key.to_string());
        self
    }

    pub fn if_input_missing(mut self, signal: StatusSignal) -> Self {
        self.if_input_missing = signal;
        self
    }
}

#[async_trait::async_trait]
impl Link for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn reads(&self) -> Vec<String> {
        self.reads.clone()
    }

    fn on_missing_input(&self) -> StatusSignal {
        self.if_input_missing
    }

    async fn initialize(&mut self) -> LinkResult {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        self.journal.push(format!("{}.initialize", self.name));
        self.on_initialize.clone()
    }

    async fn execute(&mut self, ctx: &mut LinkContext<'_>) -> LinkResult {
        let n = self.calls.execute.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.push(format!("{}.execute", self.name));
        if let Some(key) = &self.writes {
            ctx.save(key, n)?;
        }
        self.script.pop_front().unwrap_or(Ok(StatusSignal::Success))
    }

    async fn finalize(&mut self) -> LinkResult {
        self.calls.finalize.fetch_add(1, Ordering::SeqCst);
        self.journal.push(format!("{}.finalize", self.name));
        self.on_finalize.clone()
    }
}

// ============================================================================
// Tally service
// ============================================================================

/// Persistable service counting processed rows.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tally {
    pub rows: u64,
    #[serde(skip)]
    pub released: Arc<AtomicUsize>,
}

impl Tally {
    pub fn with_release_counter(released: &Arc<AtomicUsize>) -> Self {
        Self {
            rows: 0,
            released: released.clone(),
        }
    }

    fn on_release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

crate::persistent_service!(Tally, "tally", release = on_release);

/// Non-persistable service standing in for an engine session.
#[derive(Debug, Default)]
pub struct Session {
    pub opened: u32,
}

impl Service for Session {
    const NAME: &'static str = "session";
}
