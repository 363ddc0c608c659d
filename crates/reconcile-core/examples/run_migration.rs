//! Run one of the preset migrations against a SQLite document database.
//!
//! If the source collection is empty, a handful of sample records is
//! inserted first so the run has something to do.
//!
//! Usage:
//!   cargo run --package reconcile-core --example run_migration -- <db_path> [migration] [--debug]
//!
//! `migration` is one of `companies`, `quotation_companies`,
//! `follower_companies` (default: `companies`).

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use reconcile_core::{
    migrations, ChannelReporter, EngineConfig, ReconcileEngine, Record, RunPhase, SqliteStore,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <db_path> [migration] [--debug]", args[0]);
        eprintln!("Example: {} ./documents.db quotation_companies", args[0]);
        std::process::exit(1);
    }

    let debug = args.iter().any(|a| a == "--debug");
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let db_path = &args[1];
    let name = args
        .get(2)
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .unwrap_or("companies");
    let Some(spec) = migrations::by_name(name) else {
        bail!("Unknown migration: {}", name);
    };

    let store = Arc::new(
        SqliteStore::open(db_path).with_context(|| format!("opening {}", db_path))?,
    );
    if store.count(&spec.collection)? == 0 {
        seed_samples(&store, &spec.collection, &spec.key_field)?;
    }

    let (reporter, mut events) = ChannelReporter::new();
    let printer = tokio::spawn(async move {
        let mut last_batch = 0;
        while let Some(event) = events.recv().await {
            let snap = event.snapshot;
            if snap.current_batch != last_batch {
                last_batch = snap.current_batch;
                println!(
                    "[{:>3}%] unit {}/{}: {} ok, {} skipped, {} errors",
                    snap.progress_percentage,
                    snap.current_batch,
                    snap.total_batches,
                    snap.successful,
                    snap.skipped,
                    snap.errors
                );
            }
        }
    });

    info!("Running {} on {}", spec.name, db_path);
    let mut engine = ReconcileEngine::new(store.clone(), spec, EngineConfig::default())?
        .with_reporter(reporter);

    let outcome = engine.start().await;
    let progress = engine.progress().clone();
    drop(engine);
    printer.await?;

    match outcome {
        Ok(RunPhase::Completed) => {
            println!(
                "Migration complete: {} linked, {} errors, {} targets created ({} scanned)",
                progress.successful, progress.errors, progress.targets_created, progress.scanned_records
            );
            if progress.scan_truncated {
                println!("Warning: scan stopped at the page ceiling; run again to continue");
            }
        }
        Ok(phase) => println!("Run ended {}", phase),
        Err(e) => bail!("Migration failed: {}", e),
    }
    Ok(())
}

fn seed_samples(store: &SqliteStore, collection: &str, key_field: &str) -> anyhow::Result<()> {
    let samples = [
        ("s-001", Some("KEY-A"), "Northwind Travel"),
        ("s-002", Some("KEY-A"), "Northwind Travel"),
        ("s-003", Some("KEY-B"), "Blue Lagoon Tours"),
        ("s-004", None, "Solo Guide Co"),
        ("s-005", None, "Harbor Walks"),
    ];
    for (id, key, company_name) in samples {
        let mut record = Record::new(id).with_field("company_name", company_name);
        if let Some(key) = key {
            record = record.with_field(key_field, key);
        }
        store.put(collection, &record)?;
    }
    println!("Seeded {} sample records into {}", samples.len(), collection);
    Ok(())
}
