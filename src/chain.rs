//! Chains: ordered sequences of links run under one repeat/skip/abort policy.
//!
//! Running a chain initializes every link in order, executes the link
//! sequence (restarting it from the top whenever a link returns
//! [`StatusSignal::Repeat`]), then finalizes every link that was initialized.
//! `finalize` runs on every exit path.

use crate::datastore::{DataStore, DataStoreError};
use crate::execution::{ChainRecord, ChainState, Fault, LinkRecord};
use crate::link::{Link, LinkContext, LinkError, LinkResult, Phase};
use crate::process::PipelineError;
use crate::service::ServiceRegistry;
use crate::status::StatusSignal;
use crate::store::now_millis;

/// Outcome of one chain run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    /// Statistics and final state.
    pub record: ChainRecord,
    /// Cause of an abort.
    pub fault: Option<Fault>,
}

/// An ordered group of links.
pub struct Chain {
    name: String,
    links: Vec<Box<dyn Link>>,
    enabled: bool,
    max_repeats: Option<u64>,
    state: ChainState,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("links", &self.link_names())
            .field("enabled", &self.enabled)
            .field("max_repeats", &self.max_repeats)
            .field("state", &self.state)
            .finish()
    }
}

impl Chain {
    /// Create an empty, enabled chain.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            links: Vec::new(),
            enabled: true,
            max_repeats: None,
            state: ChainState::Idle,
        }
    }

    /// Name of the chain.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a link; links execute in insertion order.
    ///
    /// Fails with [`PipelineError::DuplicateLink`] if the chain already has a
    /// link with the same name.
    pub fn add_link<L: Link + 'static>(&mut self, link: L) -> Result<&mut Self, PipelineError> {
        if self.has_link(link.name()) {
            tracing::error!(chain = %self.name, link = link.name(), "chain.duplicate_link");
            return Err(PipelineError::DuplicateLink {
                chain: self.name.clone(),
                link: link.name().to_string(),
            });
        }
        tracing::debug!(chain = %self.name, link = link.name(), "chain.link_added");
        self.links.push(Box::new(link));
        Ok(self)
    }

    /// Check whether a link named `name` exists.
    pub fn has_link(&self, name: &str) -> bool {
        self.links.iter().any(|l| l.name() == name)
    }

    /// Remove the link named `name`. Returns `true` if it existed.
    pub fn remove_link(&mut self, name: &str) -> bool {
        let before = self.links.len();
        self.links.retain(|l| l.name() != name);
        before != self.links.len()
    }

    /// Names of the links, in execution order.
    pub fn link_names(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.name()).collect()
    }

    /// Number of links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Check if the chain has no links.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Remove every link.
    pub fn clear(&mut self) {
        self.links.clear();
    }

    /// Whether the chain runs.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the chain.
    pub fn set_enabled(&mut self, enabled: bool) -> &mut Self {
        self.enabled = enabled;
        self
    }

    /// Enable the chain.
    pub fn enable(&mut self) -> &mut Self {
        self.set_enabled(true)
    }

    /// Disable the chain; a disabled chain is skipped without running links.
    pub fn disable(&mut self) -> &mut Self {
        self.set_enabled(false)
    }

    /// Cap on repeats for this chain, overriding the run default.
    pub fn set_max_repeats(&mut self, max_repeats: Option<u64>) -> &mut Self {
        self.max_repeats = max_repeats;
        self
    }

    /// The chain's own repeat cap.
    pub fn max_repeats(&self) -> Option<u64> {
        self.max_repeats
    }

    /// State after the most recent run.
    pub fn state(&self) -> ChainState {
        self.state
    }

    pub(crate) fn reset_state(&mut self) {
        self.state = ChainState::Idle;
    }

    /// Log the chain and its links.
    pub fn log_summary(&self) {
        tracing::debug!(chain = %self.name, enabled = self.enabled, links = self.links.len(), "chain.summary");
        for link in &self.links {
            tracing::debug!(
                chain = %self.name,
                link = link.name(),
                reads = ?link.reads(),
                writes = ?link.writes(),
                "chain.link"
            );
        }
    }

    /// Run the chain against `store` and `services`.
    ///
    /// `default_max_repeats` applies when the chain has no cap of its own.
    pub async fn run(
        &mut self,
        store: &mut DataStore,
        services: &mut ServiceRegistry,
        default_max_repeats: Option<u64>,
    ) -> ChainOutcome {
        let Chain {
            name,
            links,
            enabled,
            max_repeats,
            state,
        } = self;
        let name = name.as_str();
        let link_names: Vec<String> = links.iter().map(|l| l.name().to_string()).collect();
        let mut record = ChainRecord::new(name);
        record.links = link_names.iter().map(LinkRecord::new).collect();

        if !*enabled {
            tracing::info!(chain = name, "chain.skipped");
            *state = ChainState::Skipped;
            record.complete(ChainState::Skipped);
            return ChainOutcome { record, fault: None };
        }

        *state = ChainState::Running;
        tracing::info!(chain = name, links = links.len(), "chain.start");

        let mut fault = None;
        let mut final_state = ChainState::Completed;

        // Initialize
        let mut initialized = 0;
        let mut skip_execute = false;
        for (index, link) in links.iter_mut().enumerate() {
            let link_name = link_names[index].as_str();
            initialized = index + 1;
            let result = link.initialize().await;
            let signal = observe(name, link_name, Phase::Initialize, result, &mut fault);
            record.links[index].last_signal = Some(signal);
            match signal {
                StatusSignal::Success => {}
                StatusSignal::Repeat => {
                    tracing::warn!(chain = name, link = link_name, phase = "initialize", "link.repeat_ignored");
                }
                StatusSignal::SkipChain => {
                    tracing::warn!(chain = name, link = link_name, phase = "initialize", "chain.skip_requested");
                    skip_execute = true;
                    break;
                }
                StatusSignal::Failure | StatusSignal::AbortChain => {
                    final_state = ChainState::Aborted;
                    break;
                }
            }
        }

        // Execute
        if final_state == ChainState::Completed && !skip_execute {
            let cap = max_repeats.or(default_max_repeats);
            'passes: loop {
                record.passes += 1;
                let pass = record.passes;
                tracing::debug!(chain = name, pass, "chain.pass");

                for (index, link) in links.iter_mut().enumerate() {
                    let link_name = link_names[index].as_str();
                    let started_at = now_millis();
                    let result = match missing_input(store, &**link) {
                        Some(key) => match link.on_missing_input() {
                            StatusSignal::Failure => {
                                Err(LinkError::DataStore(DataStoreError::KeyNotFound(key)))
                            }
                            signal => {
                                tracing::warn!(
                                    chain = name,
                                    link = link_name,
                                    key = %key,
                                    signal = signal.as_str(),
                                    "link.input_missing"
                                );
                                Ok(signal)
                            }
                        },
                        None => {
                            let mut ctx = LinkContext::new(store, services, name, link_name, pass);
                            link.execute(&mut ctx).await
                        }
                    };
                    let signal = observe(name, link_name, Phase::Execute, result, &mut fault);
                    record.links[index].record_execution(started_at, signal);

                    match signal {
                        StatusSignal::Success => {}
                        StatusSignal::SkipChain => {
                            tracing::warn!(chain = name, link = link_name, "chain.skip_requested");
                            break 'passes;
                        }
                        StatusSignal::Repeat => {
                            // Pass `n` asking to repeat is the n-th repeat.
                            if let Some(limit) = cap.filter(|limit| pass > *limit) {
                                tracing::error!(chain = name, link = link_name, limit, "chain.repeat_limit");
                                fault = Some(Fault {
                                    chain: name.to_string(),
                                    link: Some(link_name.to_string()),
                                    phase: Phase::Execute,
                                    signal: StatusSignal::Repeat,
                                    error: Some(format!("repeat limit of {} exceeded", limit)),
                                });
                                final_state = ChainState::Aborted;
                                break 'passes;
                            }
                            tracing::info!(chain = name, link = link_name, pass, "chain.repeat");
                            continue 'passes;
                        }
                        StatusSignal::Failure | StatusSignal::AbortChain => {
                            final_state = ChainState::Aborted;
                            break 'passes;
                        }
                    }
                }
                break;
            }
        }

        // Finalize every link whose initialize ran, whatever happened above.
        for (index, link) in links.iter_mut().take(initialized).enumerate() {
            let link_name = link_names[index].as_str();
            let result = link.finalize().await;
            let signal = match result {
                // Keep the first fault; later finalize errors are only logged.
                Err(e) if fault.is_some() => {
                    tracing::error!(chain = name, link = link_name, error = %e, "link.finalize_failed");
                    StatusSignal::Failure
                }
                other => observe(name, link_name, Phase::Finalize, other, &mut fault),
            };
            let link_record = &mut record.links[index];
            link_record.finalized = true;
            link_record.last_signal = Some(signal);
            match signal {
                StatusSignal::Failure | StatusSignal::AbortChain => final_state = ChainState::Aborted,
                StatusSignal::Repeat => {
                    tracing::warn!(chain = name, link = link_name, phase = "finalize", "link.repeat_ignored");
                }
                StatusSignal::Success | StatusSignal::SkipChain => {}
            }
        }

        *state = final_state;
        record.complete(final_state);
        match &fault {
            Some(f) if final_state == ChainState::Aborted => {
                tracing::error!(chain = name, passes = record.passes, fault = %f, "chain.aborted")
            }
            _ => tracing::info!(
                chain = name,
                passes = record.passes,
                duration_ms = record.duration_ms().unwrap_or_default(),
                "chain.end"
            ),
        }
        ChainOutcome { record, fault }
    }
}

/// First declared input of `link` missing from `store`.
fn missing_input(store: &DataStore, link: &dyn Link) -> Option<String> {
    link.reads().into_iter().find(|key| !store.contains(key))
}

/// Turn a phase result into the signal the chain acts on, recording the
/// first fault.
fn observe(
    chain: &str,
    link: &str,
    phase: Phase,
    result: LinkResult,
    fault: &mut Option<Fault>,
) -> StatusSignal {
    let (signal, error) = match result {
        Ok(signal) => (signal, None),
        Err(e) => (StatusSignal::Failure, Some(e.to_string())),
    };
    tracing::debug!(chain, link, phase = phase.as_str(), signal = signal.as_str(), "link.phase");
    if signal.stops_run() {
        match &error {
            Some(e) => tracing::error!(chain, link, phase = phase.as_str(), error = %e, "link.failed"),
            None => tracing::error!(chain, link, phase = phase.as_str(), signal = signal.as_str(), "link.stopped"),
        }
        if fault.is_none() {
            *fault = Some(Fault {
                chain: chain.to_string(),
                link: Some(link.to_string()),
                phase,
                signal,
                error,
            });
        }
    }
    signal
}
