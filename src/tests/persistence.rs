//! Checkpoint and resume tests.
//!
//! Pipelines here use three chains `A`, `B`, `C`, each with one scripted link that
//! writes its execution count under its lowercase name.

use std::path::Path;
use std::sync::Arc;

use crate::{
    BreakLink, Checkpoint, CheckpointPolicy, CheckpointStore, ConfigObject, FileCheckpointStore,
    FnLink, InMemoryCheckpointStore, PipelineError, ProcessManager, RunId, RunSettings,
    ServiceError, StatusSignal,
};

use super::common::{Calls, Journal, Scripted, Tally};

fn abc(journal: &Journal, settings: RunSettings) -> (ProcessManager, [Calls; 3]) {
    let mut pm = ProcessManager::with_settings(settings);
    let mut calls = Vec::new();
    for (chain, link) in [("A", "a"), ("B", "b"), ("C", "c")] {
        let scripted = Scripted::new(link, journal).writing(link);
        calls.push(scripted.calls());
        pm.add_chain(chain).expect("chain").add_link(scripted).expect("link");
    }
    let calls: [Calls; 3] = match calls.try_into() {
        Ok(calls) => calls,
        Err(_) => unreachable!("three chains"),
    };
    (pm, calls)
}

fn file_settings(dir: &Path, checkpoints: CheckpointPolicy) -> RunSettings {
    RunSettings {
        checkpoints,
        checkpoint_dir: Some(dir.to_path_buf()),
        ..RunSettings::default()
    }
}

/// Every completed chain is checkpointed with the store as it was then.
#[tokio::test]
async fn checkpoint_after_each_chain() {
    let journal = Journal::default();
    let store = Arc::new(InMemoryCheckpointStore::new());
    let (pm, _) = abc(
        &journal,
        RunSettings {
            checkpoints: CheckpointPolicy::EachChain,
            ..RunSettings::default()
        },
    );
    let mut pm = pm.with_checkpoint_store(store.clone());

    let report = pm.run().await.expect("run");

    assert!(report.is_success());
    assert_eq!(report.checkpoints, vec!["A", "B", "C"]);
    assert_eq!(store.len(), 3);
    let latest = store.latest().await.expect("latest").expect("some");
    assert_eq!(latest.chain, "C");
    assert_eq!(latest.run_id, report.run_id);

    let after_b = store.get("B").await.expect("B");
    assert!(after_b.data_store.contains("a"));
    assert!(after_b.data_store.contains("b"));
    assert!(!after_b.data_store.contains("c"));
    assert!(after_b.services.contains_key("config"));
}

/// A failed run resumes at the chain after the latest checkpoint.
#[tokio::test]
async fn resume_from_latest_after_failure() {
    let journal = Journal::default();
    let (pm, [a, b, c]) = abc(
        &journal,
        RunSettings {
            checkpoints: CheckpointPolicy::EachChain,
            ..RunSettings::default()
        },
    );
    let mut pm = pm.with_checkpoint_store(InMemoryCheckpointStore::new());
    pm.chain_mut("C")
        .expect("C")
        .add_link(BreakLink::new("stop"))
        .expect("stop");

    let failed = pm.run().await.expect("first run");
    assert!(failed.is_failure());
    assert_eq!(failed.checkpoints, vec!["A", "B"]);
    assert_eq!(c.executed(), 1);

    assert!(pm.chain_mut("C").expect("C").remove_link("stop"));
    pm.settings_mut().resume_from_latest = true;
    let resumed = pm.run().await.expect("resumed run");

    assert!(resumed.is_success());
    assert_eq!(resumed.resumed_after.as_deref(), Some("B"));
    assert_eq!(resumed.chains.len(), 1);
    assert_eq!(a.executed(), 1);
    assert_eq!(b.executed(), 1);
    assert_eq!(c.executed(), 2);
    assert_eq!(pm.store().keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
}

/// A new manager starting at a later chain restores from files on disk.
#[tokio::test]
async fn begin_with_chain_restores_from_file_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal = Journal::default();

    let (mut first, _) = abc(&journal, file_settings(dir.path(), CheckpointPolicy::EachChain));
    first.store_mut().set("ignored", 0).expect("set");
    assert!(first.run().await.expect("first run").is_success());
    assert!(FileCheckpointStore::new(dir.path()).path_for("B").exists());

    let mut settings = file_settings(dir.path(), CheckpointPolicy::Never);
    settings.begin_with_chain = Some("C".into());
    let (mut second, [a, b, c]) = abc(&journal, settings);

    let report = second.run().await.expect("second run");

    assert!(report.is_success());
    assert_eq!(report.resumed_after.as_deref(), Some("B"));
    assert_eq!((a.executed(), b.executed(), c.executed()), (0, 0, 1));
    assert_eq!(second.store().keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
}

/// The nearest earlier checkpoint is used when the chain just before the
/// window has none; the chains between it and the window run again.
#[tokio::test]
async fn begin_with_chain_uses_nearest_earlier_checkpoint() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let journal = Journal::default();

    let (first, _) = abc(
        &journal,
        RunSettings {
            checkpoints: CheckpointPolicy::OneChain("A".into()),
            ..RunSettings::default()
        },
    );
    let mut first = first.with_checkpoint_store(store.clone());
    let report = first.run().await.expect("first run");
    assert_eq!(report.checkpoints, vec!["A"]);

    let (second, [a, b, c]) = abc(
        &journal,
        RunSettings {
            begin_with_chain: Some("C".into()),
            ..RunSettings::default()
        },
    );
    let mut second = second.with_checkpoint_store(store);
    let report = second.run().await.expect("second run");

    assert!(report.is_success());
    assert_eq!(report.resumed_after.as_deref(), Some("A"));
    assert_eq!((a.executed(), b.executed(), c.executed()), (0, 1, 1));
    assert_eq!(report.chains.len(), 2);
    assert_eq!(second.store().keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
}

/// `resume_from_latest` ignores a later `begin_with_chain` and replays the
/// chains after the checkpoint.
#[tokio::test]
async fn resume_from_latest_replays_chains_before_window() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let journal = Journal::default();

    let (first, _) = abc(
        &journal,
        RunSettings {
            checkpoints: CheckpointPolicy::OneChain("A".into()),
            end_with_chain: Some("A".into()),
            ..RunSettings::default()
        },
    );
    let mut first = first.with_checkpoint_store(store.clone());
    assert!(first.run().await.expect("first run").is_success());

    let (second, [a, b, c]) = abc(
        &journal,
        RunSettings {
            resume_from_latest: true,
            begin_with_chain: Some("C".into()),
            ..RunSettings::default()
        },
    );
    let mut second = second.with_checkpoint_store(store);
    let report = second.run().await.expect("second run");

    assert!(report.is_success());
    assert_eq!(report.resumed_after.as_deref(), Some("A"));
    assert_eq!((a.executed(), b.executed(), c.executed()), (0, 1, 1));
    assert!(second.store().contains("b"));
}

/// A checkpoint whose service states cannot be decoded leaves the manager's
/// data store untouched.
#[tokio::test]
async fn undecodable_checkpoint_keeps_store() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let mut checkpoint_store = crate::DataStore::new();
    checkpoint_store.set("a", 1).expect("set");
    let mut services = std::collections::BTreeMap::new();
    services.insert("config".to_string(), serde_json::json!({ "version": "bad" }));
    store
        .save(Checkpoint::new(RunId::new(), "A", checkpoint_store, services))
        .await
        .expect("save");

    let journal = Journal::default();
    let (pm, [a, b, _]) = abc(
        &journal,
        RunSettings {
            resume_from_latest: true,
            ..RunSettings::default()
        },
    );
    let mut pm = pm.with_checkpoint_store(store);
    pm.store_mut().set("keep", true).expect("set");

    let err = pm.run().await.expect_err("bad config state");

    assert!(matches!(err, PipelineError::Service(ServiceError::Codec { .. })));
    assert!(pm.store().contains("keep"));
    assert!(!pm.store().contains("a"));
    assert_eq!((a.initialized(), b.initialized()), (0, 0));
}

#[tokio::test]
async fn begin_with_chain_without_checkpoint_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal = Journal::default();
    let mut settings = file_settings(dir.path(), CheckpointPolicy::Never);
    settings.begin_with_chain = Some("B".into());
    let (mut pm, [a, ..]) = abc(&journal, settings);

    let err = pm.run().await.expect_err("nothing to resume from");

    assert!(matches!(err, PipelineError::Resume(_)));
    assert_eq!(a.initialized(), 0);
}

#[tokio::test]
async fn resume_requires_a_checkpoint_store() {
    let journal = Journal::default();
    let (mut pm, _) = abc(
        &journal,
        RunSettings {
            resume_from_latest: true,
            ..RunSettings::default()
        },
    );
    assert_eq!(pm.run().await.err(), Some(PipelineError::NoCheckpointStore));

    let (mut pm, _) = abc(
        &journal,
        RunSettings {
            checkpoints: CheckpointPolicy::EachChain,
            ..RunSettings::default()
        },
    );
    assert_eq!(pm.run().await.err(), Some(PipelineError::NoCheckpointStore));
}

#[tokio::test]
async fn resume_from_empty_store_fails() {
    let journal = Journal::default();
    let (pm, _) = abc(
        &journal,
        RunSettings {
            resume_from_latest: true,
            ..RunSettings::default()
        },
    );
    let mut pm = pm.with_checkpoint_store(InMemoryCheckpointStore::new());
    assert!(matches!(pm.run().await, Err(PipelineError::Resume(_))));
}

/// `end_with_chain` stops early; `LastChain` checkpoints only that chain.
#[tokio::test]
async fn end_with_chain_and_last_chain_policy() {
    let journal = Journal::default();
    let store = Arc::new(InMemoryCheckpointStore::new());
    let (pm, [_, _, c]) = abc(
        &journal,
        RunSettings {
            end_with_chain: Some("B".into()),
            checkpoints: CheckpointPolicy::LastChain,
            ..RunSettings::default()
        },
    );
    let mut pm = pm.with_checkpoint_store(store.clone());

    let report = pm.run().await.expect("run");

    assert!(report.is_success());
    assert_eq!(report.checkpoints, vec!["B"]);
    assert_eq!(c.initialized(), 0);
    assert_eq!(report.chain_state("C"), None);
    assert!(!store.exists("A").await.expect("exists"));
}

#[tokio::test]
async fn invalid_windows_are_rejected() {
    let journal = Journal::default();
    let (mut pm, _) = abc(
        &journal,
        RunSettings {
            begin_with_chain: Some("C".into()),
            end_with_chain: Some("A".into()),
            ..RunSettings::default()
        },
    );
    assert_eq!(
        pm.run().await.err(),
        Some(PipelineError::InvalidWindow {
            begin: "C".into(),
            end: "A".into(),
        })
    );

    pm.settings_mut().end_with_chain = Some("B".into());
    assert_eq!(
        pm.run().await.err(),
        Some(PipelineError::InvalidWindow {
            begin: "C".into(),
            end: "B".into(),
        })
    );

    pm.settings_mut().begin_with_chain = Some("Z".into());
    assert_eq!(
        pm.run().await.err(),
        Some(PipelineError::UnknownChain("Z".into()))
    );
}

/// Disabled chains are not checkpointed.
#[tokio::test]
async fn skipped_chain_is_not_checkpointed() {
    let journal = Journal::default();
    let (pm, _) = abc(
        &journal,
        RunSettings {
            checkpoints: CheckpointPolicy::EachChain,
            ..RunSettings::default()
        },
    );
    let mut pm = pm.with_checkpoint_store(InMemoryCheckpointStore::new());
    pm.chain_mut("B").expect("B").disable();

    let report = pm.run().await.expect("run");

    assert_eq!(report.checkpoints, vec!["A", "C"]);
}

/// Persistable services and the config object survive into a new manager.
#[tokio::test]
async fn services_survive_resume() {
    let dir = tempfile::tempdir().expect("tempdir");

    let build = |settings: RunSettings| {
        let mut pm = ProcessManager::with_settings(settings);
        pm.add_chain("count")
            .expect("chain")
            .add_link(FnLink::new("counter", |ctx| {
                ctx.service_or_create(Tally::default)?.rows += 5;
                Ok(StatusSignal::Success)
            }))
            .expect("counter");
        pm.add_chain("report")
            .expect("chain")
            .add_link(FnLink::new("reporter", |ctx| {
                let rows = ctx.service::<Tally>()?.rows;
                let analysis = ctx.config()?.analysis_name.clone();
                ctx.save("summary", format!("{}: {} rows", analysis, rows))?;
                Ok(StatusSignal::Success)
            }))
            .expect("reporter");
        pm
    };

    let mut settings = file_settings(dir.path(), CheckpointPolicy::OneChain("count".into()));
    settings.end_with_chain = Some("count".into());
    let mut first = build(settings);
    first
        .services_mut()
        .get::<ConfigObject>()
        .expect("config")
        .analysis_name = "zee".into();
    assert!(first.run().await.expect("first run").is_success());

    let mut settings = file_settings(dir.path(), CheckpointPolicy::Never);
    settings.begin_with_chain = Some("report".into());
    let mut second = build(settings);
    let report = second.run().await.expect("second run");

    assert!(report.is_success());
    assert_eq!(
        second.store().get_as::<String>("summary").expect("summary"),
        "zee: 5 rows"
    );
}

/// Run settings loaded from TOML drive checkpointing.
#[tokio::test]
async fn settings_file_enables_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("run.toml");
    let text = format!(
        "checkpoints = \"each_chain\"\ncheckpoint_dir = {:?}\n",
        dir.path().join("ckpt").display().to_string()
    );
    tokio::fs::write(&path, text).await.expect("write settings");

    let settings = RunSettings::load(&path).await.expect("load");
    let journal = Journal::default();
    let (mut pm, _) = abc(&journal, settings);

    let report = pm.run().await.expect("run");

    assert_eq!(report.checkpoints.len(), 3);
    let store = FileCheckpointStore::new(dir.path().join("ckpt"));
    assert_eq!(
        store.latest().await.expect("latest").map(|c| c.chain),
        Some("C".to_string())
    );
}
