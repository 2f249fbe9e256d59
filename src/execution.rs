//! Run bookkeeping: chain states, per-link timing and the run report.
//!
//! These records are what `ProcessManager::run` hands back to the caller: one
//! aggregate status, the state each chain ended in, and the fault (chain,
//! link, phase) that stopped the run, if any.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::link::Phase;
use crate::status::StatusSignal;
use crate::store::{now_millis, RunId};

// ============================================================================
// Chain State
// ============================================================================

/// Lifecycle state of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChainState {
    /// Not run yet.
    #[default]
    Idle,
    /// Links are being processed.
    Running,
    /// All links ran, or a link asked to skip the rest of the chain.
    Completed,
    /// The chain is disabled and was not run.
    Skipped,
    /// A link failed or asked to abort; the run stops after this chain.
    Aborted,
}

impl ChainState {
    /// Lowercase label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
        }
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Execution statistics for a single link during one chain run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Name of the link.
    pub name: String,
    /// Number of times `execute` was invoked.
    pub executions: u64,
    /// Total wall time spent in `execute` (ms).
    pub execute_ms: u64,
    /// Whether `finalize` was invoked.
    pub finalized: bool,
    /// Signal returned by the most recent phase call.
    pub last_signal: Option<StatusSignal>,
}

impl LinkRecord {
    /// Create an empty record for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executions: 0,
            execute_ms: 0,
            finalized: false,
            last_signal: None,
        }
    }

    /// Record one `execute` call that started at `started_at`.
    pub fn record_execution(&mut self, started_at: u64, signal: StatusSignal) {
        self.executions += 1;
        self.execute_ms += now_millis().saturating_sub(started_at);
        self.last_signal = Some(signal);
    }
}

/// What happened to one chain during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    /// Name of the chain.
    pub name: String,
    /// State the chain ended in.
    pub state: ChainState,
    /// Number of execute passes over the link sequence.
    pub passes: u64,
    /// When the chain started (Unix timestamp ms).
    pub started_at: u64,
    /// When the chain ended (Unix timestamp ms).
    pub completed_at: Option<u64>,
    /// Per-link statistics, in declared order.
    pub links: Vec<LinkRecord>,
}

impl ChainRecord {
    /// Start a record for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ChainState::Idle,
            passes: 0,
            started_at: now_millis(),
            completed_at: None,
            links: Vec::new(),
        }
    }

    /// Close the record with its final state.
    pub fn complete(&mut self, state: ChainState) {
        self.state = state;
        self.completed_at = Some(now_millis());
    }

    /// Duration in milliseconds, if the chain has ended.
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| end.saturating_sub(self.started_at))
    }

    /// Statistics for the link named `name`.
    pub fn link(&self, name: &str) -> Option<&LinkRecord> {
        self.links.iter().find(|l| l.name == name)
    }
}

// ============================================================================
// Fault
// ============================================================================

/// The cause of a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Chain in which the fault occurred.
    pub chain: String,
    /// Link that raised it, if a link did.
    pub link: Option<String>,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Signal observed by the chain.
    pub signal: StatusSignal,
    /// Error message, when the link returned an error rather than a signal.
    pub error: Option<String>,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain {}", self.chain)?;
        if let Some(link) = &self.link {
            write!(f, ", link {}", link)?;
        }
        write!(f, ": {} returned {}", self.phase, self.signal)?;
        if let Some(error) = &self.error {
            write!(f, " ({})", error)?;
        }
        Ok(())
    }
}

// ============================================================================
// Run Report
// ============================================================================

/// Result of `ProcessManager::run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Identifier of this run.
    pub run_id: RunId,
    /// Aggregate status: `Success` or `Failure`.
    pub status: StatusSignal,
    /// Records of the chains that were considered, in run order.
    pub chains: Vec<ChainRecord>,
    /// The cause of a failure.
    pub fault: Option<Fault>,
    /// Chain whose checkpoint the run resumed from.
    pub resumed_after: Option<String>,
    /// Chains checkpointed during the run.
    pub checkpoints: Vec<String>,
    /// When the run started (Unix timestamp ms).
    pub started_at: u64,
    /// When the run ended (Unix timestamp ms).
    pub completed_at: Option<u64>,
}

impl RunReport {
    /// Start a report for a new run.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: StatusSignal::Success,
            chains: Vec::new(),
            fault: None,
            resumed_after: None,
            checkpoints: Vec::new(),
            started_at: now_millis(),
            completed_at: None,
        }
    }

    /// Returns `true` if the run succeeded.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns `true` if the run failed.
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// Record of the chain named `name`.
    pub fn chain(&self, name: &str) -> Option<&ChainRecord> {
        self.chains.iter().find(|c| c.name == name)
    }

    /// State of the chain named `name`, if it was considered.
    pub fn chain_state(&self, name: &str) -> Option<ChainState> {
        self.chain(name).map(|c| c.state)
    }

    /// Duration in milliseconds, if the run has ended.
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| end.saturating_sub(self.started_at))
    }

    pub(crate) fn finish(&mut self, status: StatusSignal) {
        self.status = status;
        self.completed_at = Some(now_millis());
    }
}
