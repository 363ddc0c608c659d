//! End-to-end tests of the reconciliation engine against the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reconcile_core::{
    migrations, EngineConfig, LogLevel, MemoryStore, MigrationSpec, OperationType,
    ProgressEvent, ProgressSnapshot, ReconcileEngine, Record, RetryConfig, RunPhase, StoreOp,
};

fn test_config() -> EngineConfig {
    EngineConfig::default()
        .without_throttle()
        .with_retry(RetryConfig::new().with_base_delay(Duration::from_millis(1)))
}

fn tour(id: &str, license_key: Option<&str>) -> Record {
    let record = Record::new(id);
    match license_key {
        Some(key) => record.with_field("license_key", key),
        None => record,
    }
}

fn new_engine(store: &Arc<MemoryStore>) -> ReconcileEngine {
    ReconcileEngine::new(store.clone(), migrations::companies(), test_config()).unwrap()
}

fn company_of(store: &MemoryStore, tour_id: &str) -> Option<String> {
    store
        .get("tours", tour_id)
        .and_then(|r| r.get_str("company_id").map(str::to_string))
}

/// Collects every snapshot the engine emits.
fn snapshot_recorder() -> (
    Arc<Mutex<Vec<ProgressSnapshot>>>,
    impl Fn(&ProgressEvent) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let reporter = move |event: &ProgressEvent| {
        sink.lock().unwrap().push(event.snapshot.clone());
    };
    (seen, reporter)
}

#[tokio::test]
async fn test_new_group_gets_one_shared_target() {
    let store = Arc::new(MemoryStore::new());
    store.insert_many(
        "tours",
        vec![
            tour("t1", Some("LIC1")),
            tour("t2", Some("LIC1")),
            tour("t3", Some("LIC1")),
        ],
    );

    let mut engine = new_engine(&store);
    let phase = engine.start().await.unwrap();

    assert_eq!(phase, RunPhase::Completed);
    let progress = engine.progress();
    assert_eq!(progress.successful, 3);
    assert_eq!(progress.targets_created, 1);
    assert_eq!(progress.no_target_found, 1);
    assert_eq!(progress.progress_percentage(), 100);

    let companies = store.records("companies");
    assert_eq!(companies.len(), 1);
    let company_id = companies[0].id.clone();
    for id in ["t1", "t2", "t3"] {
        assert_eq!(company_of(&store, id).as_deref(), Some(company_id.as_str()));
    }
    assert_eq!(companies[0].get_str("license_key"), Some("LIC1"));

    assert_eq!(store.call_count(StoreOp::Probe), 1);
    assert_eq!(store.call_count(StoreOp::Commit), 1);
}

#[tokio::test]
async fn test_group_reuses_existing_target() {
    let store = Arc::new(MemoryStore::new());
    store.insert_many(
        "tours",
        vec![
            tour("holder", Some("LIC2")).with_field("company_id", "T9"),
            tour("t1", Some("LIC2")),
            tour("t2", Some("LIC2")),
        ],
    );

    let mut engine = new_engine(&store);
    engine.start().await.unwrap();

    let groups = engine.state().groups();
    assert_eq!(groups.len(), 1);
    assert!(!groups[0].needs_new_target);
    assert_eq!(groups[0].existing_target_id.as_deref(), Some("T9"));

    assert_eq!(company_of(&store, "t1").as_deref(), Some("T9"));
    assert_eq!(company_of(&store, "t2").as_deref(), Some("T9"));
    assert_eq!(engine.progress().targets_created, 0);
    assert_eq!(engine.progress().no_target_found, 0);
    assert!(store.is_empty("companies"));
}

#[tokio::test]
async fn test_short_reference_does_not_cause_duplicate_target() {
    let store = Arc::new(MemoryStore::new());
    store.insert_many(
        "tours",
        vec![
            tour("a", Some("LIC1")).with_field("company_id", "ab"),
            tour("b", Some("LIC1")).with_field("company_id", "T99"),
            tour("c", Some("LIC1")),
        ],
    );

    let mut engine = new_engine(&store);
    assert_eq!(engine.start().await.unwrap(), RunPhase::Completed);

    assert_eq!(engine.progress().targets_created, 0);
    assert_eq!(engine.progress().no_target_found, 0);
    assert_eq!(company_of(&store, "a").as_deref(), Some("T99"));
    assert_eq!(company_of(&store, "c").as_deref(), Some("T99"));
    assert!(store.is_empty("companies"));
}

#[tokio::test]
async fn test_individuals_get_distinct_targets_in_one_batch() {
    let store = Arc::new(MemoryStore::new());
    for i in 1..=5 {
        store.insert("tours", tour(&format!("t{}", i), None));
    }

    let mut engine = new_engine(&store);
    engine.start().await.unwrap();

    assert_eq!(store.len("companies"), 5);
    let targets: HashSet<_> = (1..=5)
        .map(|i| company_of(&store, &format!("t{}", i)).unwrap())
        .collect();
    assert_eq!(targets.len(), 5);

    let history: Vec<_> = engine.state().batch_history.iter().collect();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].operation_type, OperationType::Individual);
    assert_eq!(history[0].total_in_batch, 5);
    assert_eq!(history[0].targets_created, 5);
    assert_eq!(engine.progress().total_batches, 1);
}

#[tokio::test]
async fn test_resume_continues_after_committed_group() {
    let store = Arc::new(MemoryStore::new());
    store.insert_many(
        "tours",
        vec![
            tour("a1", Some("LIC1")),
            tour("a2", Some("LIC1")),
            tour("a3", Some("LIC1")),
            tour("b1", Some("LIC3")),
            tour("b2", Some("LIC3")),
        ],
    );

    let engine = new_engine(&store);
    let pause = engine.pause_handle();
    let fired = Arc::new(AtomicBool::new(false));
    let mut engine = engine.with_reporter(move |event: &ProgressEvent| {
        let lic1_done = event
            .latest_batch
            .as_ref()
            .and_then(|b| b.group_key.as_deref())
            == Some("LIC1");
        if lic1_done && !fired.swap(true, Ordering::SeqCst) {
            pause.request();
        }
    });

    assert_eq!(engine.start().await.unwrap(), RunPhase::Paused);
    assert_eq!(engine.progress().current_batch, 1);
    assert_eq!(engine.progress().processed_records, 3);
    assert_eq!(store.len("companies"), 1);
    assert_eq!(company_of(&store, "b1"), None);
    let lic1_target = company_of(&store, "a1").unwrap();

    assert_eq!(engine.resume().await.unwrap(), RunPhase::Completed);

    let progress = engine.progress();
    assert_eq!(progress.successful, 5);
    assert_eq!(progress.skipped, 0);
    assert_eq!(progress.processed_records, 5);
    assert_eq!(progress.targets_created, 2);
    assert_eq!(store.len("companies"), 2);
    assert_eq!(company_of(&store, "a1"), Some(lic1_target));

    let keys: Vec<_> = engine
        .state()
        .batch_history
        .iter()
        .map(|b| b.group_key.clone().unwrap())
        .collect();
    assert_eq!(keys, vec!["LIC1", "LIC3"]);
    // Groups are probed once during discovery, never again on resume
    assert_eq!(store.call_count(StoreOp::Probe), 2);
}

#[tokio::test]
async fn test_transient_probe_errors_are_retried() {
    let store = Arc::new(MemoryStore::new());
    store.insert("tours", tour("t1", Some("LIC5")));
    store.fail_next(StoreOp::Probe, 2, true, "connection reset by peer");

    let mut engine = new_engine(&store);
    let phase = engine.start().await.unwrap();

    assert_eq!(phase, RunPhase::Completed);
    assert_eq!(engine.progress().successful, 1);
    assert_eq!(engine.progress().errors, 0);
    assert_eq!(store.call_count(StoreOp::Probe), 3);

    let retry_lines: Vec<_> = engine
        .state()
        .debug_log
        .iter()
        .filter(|line| line.level == LogLevel::Debug && line.message.contains("retrying"))
        .collect();
    assert_eq!(retry_lines.len(), 2);
    assert!(retry_lines[0].message.contains("Probe for LIC5"));
}

#[tokio::test]
async fn test_grouping_uses_trimmed_string_keys() {
    let store = Arc::new(MemoryStore::new());
    store.insert_many(
        "tours",
        vec![
            tour("t1", Some(" LIC1")),
            tour("t2", Some("LIC1 ")),
            tour("t3", Some("LIC2")),
            tour("t4", Some("   ")),
            Record::new("t5").with_field("license_key", 42),
            tour("t6", None),
        ],
    );

    let mut engine = new_engine(&store);
    engine.start().await.unwrap();

    let groups = engine.state().groups();
    let summary: Vec<_> = groups
        .iter()
        .map(|g| (g.group_key.as_str(), g.len()))
        .collect();
    assert_eq!(summary, vec![("LIC1", 2), ("LIC2", 1)]);

    let individual_ids: Vec<_> = engine
        .state()
        .individuals()
        .iter()
        .map(|r| r.id.as_str())
        .collect();
    assert_eq!(individual_ids, vec!["t4", "t5", "t6"]);

    assert_eq!(company_of(&store, "t1"), company_of(&store, "t2"));
    assert_ne!(company_of(&store, "t1"), company_of(&store, "t3"));
    assert_eq!(engine.progress().keyed_records, 3);
    assert_eq!(engine.progress().individual_records, 3);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_consistent() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..7 {
        let record = tour(&format!("i{}", i), None);
        let record = if i % 3 == 0 {
            record
        } else {
            record.with_field("region", "north")
        };
        store.insert("tours", record);
    }
    store.insert_many(
        "tours",
        vec![
            tour("g1", Some("LIC1")).with_field("region", "south"),
            tour("g2", Some("LIC1")),
        ],
    );

    let spec = MigrationSpec::new("tours_by_region", "tours", "company_id", "license_key", "companies")
        .require_field("region");
    let (seen, reporter) = snapshot_recorder();
    let mut engine = ReconcileEngine::new(
        store.clone(),
        spec,
        test_config().with_individual_batch_size(3),
    )
    .unwrap()
    .with_reporter(reporter);

    engine.start().await.unwrap();

    let snapshots = seen.lock().unwrap();
    assert!(!snapshots.is_empty());
    let mut last = 0;
    for snap in snapshots.iter() {
        assert!(snap.processed_records >= last);
        assert_eq!(
            snap.processed_records,
            snap.successful + snap.skipped + snap.errors
        );
        last = snap.processed_records;
    }

    let progress = engine.progress();
    // i0, i3, i6 and g2 lack the required field
    assert_eq!(progress.errors, 4);
    assert_eq!(progress.successful, 5);
    assert_eq!(progress.processed_records, 9);
    assert!(progress.failed_record_ids.contains("g2"));
    assert_eq!(company_of(&store, "i0"), None);
    assert_eq!(progress.total_batches, 1 + 3);
}

#[tokio::test]
async fn test_pause_and_resume_matches_uninterrupted_run() {
    fn seed() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new().with_sequential_ids("co-"));
        store.insert_many(
            "tours",
            vec![
                tour("a1", Some("LIC1")),
                tour("a2", Some("LIC2")),
                tour("a3", Some("LIC1")),
                tour("b1", None),
                tour("b2", None),
                tour("b3", None),
            ],
        );
        store
    }
    let config = test_config().with_individual_batch_size(2);

    let straight = seed();
    let mut engine =
        ReconcileEngine::new(straight.clone(), migrations::companies(), config.clone()).unwrap();
    engine.start().await.unwrap();

    let interrupted = seed();
    let engine =
        ReconcileEngine::new(interrupted.clone(), migrations::companies(), config).unwrap();
    let pause = engine.pause_handle();
    let paused_at = Arc::new(AtomicUsize::new(0));
    let mut engine = engine.with_reporter(move |event: &ProgressEvent| {
        // Pause once after every unit
        let done = event.snapshot.current_batch;
        if event.snapshot.phase == RunPhase::Processing && done > paused_at.load(Ordering::SeqCst) {
            paused_at.store(done, Ordering::SeqCst);
            pause.request();
        }
    });

    let mut phase = engine.start().await.unwrap();
    let mut pauses = 0;
    while phase == RunPhase::Paused {
        pauses += 1;
        phase = engine.resume().await.unwrap();
    }

    assert_eq!(phase, RunPhase::Completed);
    assert_eq!(pauses, 3);
    assert_eq!(straight.records("tours"), interrupted.records("tours"));
    assert_eq!(straight.len("companies"), interrupted.len("companies"));
    assert_eq!(engine.progress().processed_records, 6);
    assert_eq!(engine.progress().skipped, 0);
}

#[tokio::test]
async fn test_zero_work_completes_without_processing() {
    let store = Arc::new(MemoryStore::new());
    store.insert_many(
        "tours",
        vec![
            tour("t1", Some("LIC1")).with_field("company_id", "C-001"),
            tour("t2", None).with_field("company_id", "C-002"),
        ],
    );

    let (seen, reporter) = snapshot_recorder();
    let mut engine = new_engine(&store).with_reporter(reporter);

    assert_eq!(engine.start().await.unwrap(), RunPhase::Completed);
    assert_eq!(engine.progress().total_needing_work, 0);
    assert_eq!(engine.progress().progress_percentage(), 100);
    assert_eq!(engine.progress().scanned_records, 2);

    let phases: Vec<_> = seen.lock().unwrap().iter().map(|s| s.phase).collect();
    assert!(phases.contains(&RunPhase::Scanning));
    assert!(!phases.contains(&RunPhase::Processing));
    assert_eq!(store.call_count(StoreOp::Commit), 0);
}

#[tokio::test]
async fn test_pause_during_scan_resumes_from_cursor() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..5 {
        store.insert("tours", tour(&format!("t{}", i), None));
    }

    let engine = ReconcileEngine::new(
        store.clone(),
        migrations::companies(),
        test_config().with_page_size(2),
    )
    .unwrap();
    let pause = engine.pause_handle();
    let fired = Arc::new(AtomicBool::new(false));
    let mut engine = engine.with_reporter(move |event: &ProgressEvent| {
        if event.snapshot.pages_scanned == 1 && !fired.swap(true, Ordering::SeqCst) {
            pause.request();
        }
    });

    assert_eq!(engine.start().await.unwrap(), RunPhase::Paused);
    assert_eq!(engine.progress().pages_scanned, 1);
    assert!(store.is_empty("companies"));

    assert_eq!(engine.resume().await.unwrap(), RunPhase::Completed);
    assert_eq!(engine.progress().pages_scanned, 3);
    assert_eq!(engine.progress().scanned_records, 5);
    assert_eq!(engine.progress().successful, 5);
    assert_eq!(store.call_count(StoreOp::Scan), 3);
}

#[tokio::test(start_paused = true)]
async fn test_pause_from_another_task() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..4 {
        store.insert("tours", tour(&format!("t{}", i), None));
    }

    let mut config = test_config().with_individual_batch_size(1);
    config.unit_delay = Duration::from_millis(50);
    let mut engine = ReconcileEngine::new(store.clone(), migrations::companies(), config).unwrap();
    let pause = engine.pause_handle();

    let (phase, _) = futures::join!(engine.start(), async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        pause.request();
    });

    assert_eq!(phase.unwrap(), RunPhase::Paused);
    assert_eq!(engine.progress().current_batch, 1);
    assert_eq!(store.len("companies"), 1);
}

#[tokio::test]
async fn test_failed_individual_does_not_abort_unit() {
    let store = Arc::new(MemoryStore::new());
    store.insert_many("tours", vec![tour("t1", None), tour("t2", None), tour("t3", None)]);
    // Exhausts all three attempts for the first record only
    store.fail_next(StoreOp::Create, 3, true, "service unavailable");

    let mut engine = new_engine(&store);
    assert_eq!(engine.start().await.unwrap(), RunPhase::Completed);

    let progress = engine.progress();
    assert_eq!(progress.errors, 1);
    assert_eq!(progress.successful, 2);
    assert!(progress.failed_record_ids.contains("t1"));
    assert_eq!(company_of(&store, "t1"), None);
    assert!(company_of(&store, "t2").is_some());

    let batch = engine.state().batch_history.latest().unwrap();
    assert_eq!(batch.errors, 1);
    assert_eq!(batch.error_messages.len(), 1);
    assert!(batch.error_messages[0].starts_with("t1:"));
}

#[tokio::test]
async fn test_permanent_create_error_is_not_retried() {
    let store = Arc::new(MemoryStore::new());
    store.insert_many("tours", vec![tour("t1", None), tour("t2", None)]);
    store.fail_next(StoreOp::Create, 1, false, "permission denied");

    let mut engine = new_engine(&store);
    engine.start().await.unwrap();

    assert_eq!(store.call_count(StoreOp::Create), 2);
    assert_eq!(engine.progress().errors, 1);
    assert_eq!(engine.progress().successful, 1);
}

#[tokio::test]
async fn test_commit_failure_moves_run_to_error() {
    let store = Arc::new(MemoryStore::new());
    store.insert("tours", tour("t1", Some("LIC1")));
    store.fail_next(StoreOp::Commit, 3, true, "deadline exceeded");

    let mut engine = new_engine(&store);
    let result = engine.start().await;

    assert!(result.is_err());
    assert_eq!(engine.phase(), RunPhase::Error);
    assert!(engine
        .progress()
        .error_message
        .as_deref()
        .unwrap()
        .contains("deadline exceeded"));
    assert_eq!(store.call_count(StoreOp::Commit), 3);
    assert_eq!(company_of(&store, "t1"), None);

    assert!(engine.resume().await.is_err());
    engine.reset().unwrap();
    assert_eq!(engine.phase(), RunPhase::Idle);
    assert_eq!(engine.start().await.unwrap(), RunPhase::Completed);
    assert!(company_of(&store, "t1").is_some());
}

#[tokio::test]
async fn test_probe_failure_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    store.insert("tours", tour("t1", Some("LIC1")));
    store.fail_next(StoreOp::Probe, 1, false, "missing index");

    let mut engine = new_engine(&store);
    assert!(engine.start().await.is_err());
    assert_eq!(engine.phase(), RunPhase::Error);
    assert_eq!(store.call_count(StoreOp::Create), 0);
}

#[tokio::test]
async fn test_large_group_commits_in_bounded_chunks() {
    let store = Arc::new(MemoryStore::new().with_max_batch_size(2));
    for i in 0..5 {
        store.insert("tours", tour(&format!("t{}", i), Some("LIC1")));
    }

    let mut engine = new_engine(&store);
    engine.start().await.unwrap();

    assert_eq!(store.call_count(StoreOp::Commit), 3);
    assert_eq!(store.len("companies"), 1);
    let targets: HashSet<_> = (0..5)
        .map(|i| company_of(&store, &format!("t{}", i)).unwrap())
        .collect();
    assert_eq!(targets.len(), 1);
    assert_eq!(engine.state().batch_history.len(), 1);
}

#[tokio::test]
async fn test_scan_stops_at_page_ceiling() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..5 {
        store.insert("tours", tour(&format!("t{}", i), None));
    }

    let mut engine = ReconcileEngine::new(
        store.clone(),
        migrations::companies(),
        test_config().with_page_size(2).with_max_scan_pages(2),
    )
    .unwrap();
    engine.start().await.unwrap();

    let progress = engine.progress();
    assert!(progress.scan_truncated);
    assert_eq!(progress.pages_scanned, 2);
    assert_eq!(progress.scanned_records, 4);
    assert_eq!(progress.successful, 4);
    assert!(engine
        .state()
        .debug_log
        .iter()
        .any(|line| line.level == LogLevel::Warn && line.message.contains("ceiling")));
}

#[tokio::test]
async fn test_batch_history_is_bounded() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..12 {
        store.insert("tours", tour(&format!("t{:02}", i), Some(format!("LIC{:02}", i).as_str())));
    }

    let mut engine = new_engine(&store);
    engine.start().await.unwrap();

    let history = &engine.state().batch_history;
    assert_eq!(history.len(), 10);
    assert_eq!(history.iter().next().unwrap().batch_number, 3);
    assert_eq!(history.latest().unwrap().batch_number, 12);
    assert_eq!(engine.progress().current_batch, 12);
}
