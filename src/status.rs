//! Status signals returned by every link phase.
//!
//! A [`StatusSignal`] is a plain control token. Links return it from
//! `initialize`, `execute` and `finalize`; the owning [`Chain`](crate::Chain)
//! interprets it, and the [`ProcessManager`](crate::ProcessManager) decides
//! whether the run continues.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a link phase, chain, or whole run.
///
/// Used with `Result<StatusSignal, LinkError>` so that `?` propagates hard
/// errors while routine control flow (`Repeat`, `SkipChain`) stays in the
/// `Ok` branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StatusSignal {
    /// Proceed to the next link.
    #[default]
    Success,
    /// Hard failure: the chain aborts and the run stops.
    Failure,
    /// Stop the remaining links of the current chain; the run continues.
    SkipChain,
    /// Restart the chain's link sequence from the first link.
    Repeat,
    /// Abort the current chain and stop the run after it.
    AbortChain,
}

impl StatusSignal {
    /// Returns `true` for [`StatusSignal::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Returns `true` for [`StatusSignal::Failure`].
    pub fn is_failure(self) -> bool {
        self == Self::Failure
    }

    /// Returns `true` for [`StatusSignal::SkipChain`].
    pub fn is_skip_chain(self) -> bool {
        self == Self::SkipChain
    }

    /// Returns `true` for [`StatusSignal::Repeat`].
    pub fn is_repeat(self) -> bool {
        self == Self::Repeat
    }

    /// Returns `true` for [`StatusSignal::AbortChain`].
    pub fn is_abort_chain(self) -> bool {
        self == Self::AbortChain
    }

    /// Returns `true` if this signal ends the run.
    pub fn stops_run(self) -> bool {
        matches!(self, Self::Failure | Self::AbortChain)
    }

    /// Short lowercase label used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::SkipChain => "skip_chain",
            Self::Repeat => "repeat",
            Self::AbortChain => "abort_chain",
        }
    }
}

impl fmt::Display for StatusSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
