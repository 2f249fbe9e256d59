//! A three-chain pipeline with checkpoints.
//!
//! Run with `cargo run --example demo`. The first run stops after `Clean`;
//! a second manager, standing in for a restarted process, resumes from the
//! checkpoint taken there and runs `Fit` with the restored configuration.

use catena::{
    logging, CheckpointPolicy, ConfigObject, CopyInStore, FnLink, LinkError, PrintStore,
    ProcessManager, RepeatChain, RunSettings, SkipChainIfEmpty, StatusSignal,
};

fn build(settings: RunSettings) -> Result<ProcessManager, catena::PipelineError> {
    let mut pm = ProcessManager::with_settings(settings);

    pm.add_chain("Ingest")?
        .add_link(FnLink::new("reader", |ctx| {
            let mut rows: Vec<f64> = if ctx.store_ref().contains("rows") {
                ctx.load("rows")?
            } else {
                Vec::new()
            };
            rows.extend((0..4).map(|i| (ctx.pass() * 10 + i) as f64));
            ctx.save("rows", rows)?;
            Ok(StatusSignal::Success)
        }))?
        .add_link(RepeatChain::new("more_batches").max_count(2))?;

    pm.add_chain("Clean")?
        .add_link(SkipChainIfEmpty::new("guard", ["rows"]))?
        .add_link(CopyInStore::new("backup", "rows"))?
        .add_link(
            FnLink::new("drop_odd", |ctx| {
                let rows: Vec<f64> = ctx.load("rows")?;
                let clean: Vec<f64> = rows.into_iter().filter(|r| *r as i64 % 2 == 0).collect();
                ctx.save("clean", clean)?;
                Ok(StatusSignal::Success)
            })
            .reading(["rows"])
            .writing(["clean"]),
        )?;

    pm.add_chain("Fit")?
        .add_link(
            FnLink::new("mean", |ctx| {
                let min_rows: usize = ctx.config()?.get_as("min_rows").unwrap_or(1);
                let clean: Vec<f64> = ctx.load("clean")?;
                if clean.len() < min_rows {
                    return Err(LinkError::failed(format!(
                        "need {} rows, have {}",
                        min_rows,
                        clean.len()
                    )));
                }
                let mean = clean.iter().sum::<f64>() / clean.len() as f64;
                ctx.save("mean", mean)?;
                Ok(StatusSignal::Success)
            })
            .reading(["clean"]),
        )?
        .add_link(PrintStore::new("print").keys(["mean", "rows_copy"]))?;

    Ok(pm)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing("catena=info,demo=info", false)?;

    let dir = std::env::temp_dir().join("catena-demo");
    let settings = RunSettings {
        checkpoints: CheckpointPolicy::EachChain,
        checkpoint_dir: Some(dir.clone()),
        max_repeats: Some(10),
        ..RunSettings::default()
    };
    let _ = tokio::fs::remove_dir_all(&dir).await;

    let mut pm = build(RunSettings {
        end_with_chain: Some("Clean".into()),
        ..settings.clone()
    })?;
    pm.services_mut().get::<ConfigObject>()?.set("min_rows", 3);
    let report = pm.run().await?;
    println!("first run: {} ({} chains)", report.status, report.chains.len());

    let mut pm = build(RunSettings {
        resume_from_latest: true,
        ..settings
    })?;
    let report = pm.run().await?;
    println!(
        "second run: {} (resumed after {})",
        report.status,
        report.resumed_after.as_deref().unwrap_or("nothing")
    );
    match (&report.fault, pm.store().get_as::<f64>("mean")) {
        (Some(fault), _) => println!("  fault: {}", fault),
        (None, Ok(mean)) => println!("  mean = {}", mean),
        (None, Err(e)) => println!("  no mean: {}", e),
    }

    let _ = tokio::fs::remove_dir_all(&dir).await;
    Ok(())
}
