//! Built-in links running inside chains.

use crate::{
    AssertInStore, ChainState, CopyInStore, DeleteFromStore, FnLink, PrintStore, ProcessManager,
    RepeatChain, SkipChainIfEmpty, StatusSignal,
};

use super::common::{Journal, Scripted};

/// `RepeatChain` at the end of a chain drives a fixed number of passes.
#[tokio::test]
async fn repeat_chain_loops_fixed_times() {
    let journal = Journal::default();
    let reader = Scripted::new("reader", &journal).writing("batch");
    let calls = reader.calls();

    let mut pm = ProcessManager::new();
    pm.add_chain("events")
        .expect("chain")
        .add_link(reader)
        .expect("reader")
        .add_link(RepeatChain::new("repeater").max_count(2))
        .expect("repeater");

    let report = pm.run().await.expect("run");

    assert!(report.is_success());
    assert_eq!(calls.executed(), 3);
    assert_eq!(pm.store().get_as::<usize>("batch").expect("batch"), 3);
}

/// `RepeatChain` listening to a flag loops until a link clears it.
#[tokio::test]
async fn repeat_chain_until_input_exhausted() {
    let mut pm = ProcessManager::new();
    pm.services_mut()
        .get::<crate::ConfigObject>()
        .expect("config")
        .set("more_input", true);
    pm.add_chain("stream")
        .expect("chain")
        .add_link(FnLink::new("consume", |ctx| {
            let consumed = ctx.pass();
            ctx.save("consumed", consumed)?;
            if consumed == 4 {
                ctx.config()?.set("more_input", false);
            }
            Ok(StatusSignal::Success)
        }))
        .expect("consume")
        .add_link(RepeatChain::new("repeater").listen_to("more_input"))
        .expect("repeater");

    let report = pm.run().await.expect("run");

    assert!(report.is_success());
    assert_eq!(report.chain("stream").expect("stream").passes, 4);
    assert_eq!(pm.store().get_as::<u64>("consumed").expect("consumed"), 4);
}

/// An empty input skips the rest of the chain; the next chain runs.
#[tokio::test]
async fn skip_chain_if_empty_input() {
    let journal = Journal::default();
    let mut pm = ProcessManager::new();
    pm.add_chain("Ingest")
        .expect("chain")
        .add_link(FnLink::new("reader", |ctx| {
            ctx.save("rows", Vec::<i64>::new())?;
            Ok(StatusSignal::Success)
        }))
        .expect("reader");
    pm.add_chain("Analyse")
        .expect("chain")
        .add_link(SkipChainIfEmpty::new("guard", ["rows"]))
        .expect("guard")
        .add_link(Scripted::new("fit", &journal))
        .expect("fit");
    pm.add_chain("Report")
        .expect("chain")
        .add_link(Scripted::new("report", &journal))
        .expect("report");

    let report = pm.run().await.expect("run");

    assert!(report.is_success());
    assert_eq!(report.chain_state("Analyse"), Some(ChainState::Completed));
    assert_eq!(journal.phase("execute"), vec!["report"]);
}

/// Copy, assert, print and delete as a housekeeping chain.
#[tokio::test]
async fn housekeeping_chain() {
    let mut pm = ProcessManager::new();
    pm.add_chain("Ingest")
        .expect("chain")
        .add_link(FnLink::new("reader", |ctx| {
            ctx.save("raw", vec![1, 2, 3])?;
            ctx.save("scratch", "tmp")?;
            Ok(StatusSignal::Success)
        }))
        .expect("reader");
    pm.add_chain("Housekeeping")
        .expect("chain")
        .add_link(CopyInStore::new("backup", "raw"))
        .expect("backup")
        .add_link(CopyInStore::new("rename", "raw").store_key("input").move_value())
        .expect("rename")
        .add_link(AssertInStore::new("check", ["raw_copy", "input"]))
        .expect("check")
        .add_link(PrintStore::new("print"))
        .expect("print")
        .add_link(DeleteFromStore::new("cleanup").delete(["scratch"]))
        .expect("cleanup");

    let report = pm.run().await.expect("run");

    assert!(report.is_success());
    assert_eq!(
        pm.store().keys().collect::<Vec<_>>(),
        vec!["input", "raw_copy"]
    );
}

/// A link with invalid configuration fails the run at initialize.
#[tokio::test]
async fn invalid_link_configuration_fails_run() {
    let mut pm = ProcessManager::new();
    pm.add_chain("only")
        .expect("chain")
        .add_link(DeleteFromStore::new("nothing_to_do"))
        .expect("link");

    let report = pm.run().await.expect("run");

    assert!(report.is_failure());
    assert_eq!(
        report.fault.expect("fault").phase,
        crate::Phase::Initialize
    );
}
