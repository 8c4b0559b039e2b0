use aggregoor::config::Config;
use aggregoor::context::EngineContext;
use aggregoor::model::{Record, Value};
use aggregoor::storage::memory::MemoryBackend;
use aggregoor::worker::Delivery;

const CONFIG: &str = r#"
timer:
  initial_delay: 1h
  period: 1h
workers:
  queue_size: 64
  default_pool_size: 2
roles:
  - name: endpoint_hits
    schema:
      attributes:
        - { name: id, type: string, merge: non }
        - { name: hits, type: int64, merge: cover }
  - name: span
    persistence: insert_only
    schema:
      attributes:
        - { name: trace_id, type: string }
        - { name: duration, type: int32 }
  - name: call_count
    schema:
      attributes:
        - { name: calls, type: int64, merge: sum }
        - { name: slowest, type: int32, merge: max }
"#;

fn engine(backend: &MemoryBackend) -> EngineContext<MemoryBackend> {
    let cfg = Config::from_yaml(CONFIG).expect("config");
    EngineContext::build(&cfg, backend.clone(), None).expect("engine")
}

/// Moves everything queued so far into the worker windows, the way the
/// spawned consumer tasks would.
fn drain_queues(engine: &EngineContext<MemoryBackend>) {
    for worker in engine.workers() {
        while let Some(record) = worker.queue().try_pop() {
            worker.absorb(record);
        }
    }
}

fn hits(id: &str, hits: i64) -> Record {
    Record::new(id, vec![Value::from(id), Value::from(hits)])
}

#[tokio::test]
async fn test_cover_keeps_last_value_before_flush() {
    let backend = MemoryBackend::new();
    let engine = engine(&backend);
    let registry = engine.registry();

    assert_eq!(
        registry.tell("endpoint_hits", hits("A", 3)).await.expect("tell"),
        Delivery::Enqueued
    );
    assert_eq!(
        registry.tell("endpoint_hits", hits("A", 5)).await.expect("tell"),
        Delivery::Enqueued
    );
    drain_queues(&engine);

    let report = engine.timer().tick().await;
    assert_eq!(report.inserts, 1);
    assert_eq!(report.updates, 0);
    assert!(!report.failed);

    let stored = backend.record("endpoint_hits", "A").expect("stored");
    assert_eq!(stored.get(1), Some(&Value::Int64(5)));
}

#[tokio::test]
async fn test_insert_only_never_reads_storage() {
    let backend = MemoryBackend::new();
    let engine = engine(&backend);

    for id in ["trace-1", "trace-2"] {
        let record = Record::new(id, vec![Value::from(id), Value::from(12i32)]);
        engine.registry().tell("span", record).await.expect("tell");
    }
    drain_queues(&engine);

    let report = engine.timer().tick().await;
    assert_eq!(report.inserts, 2);
    assert_eq!(report.updates, 0);
    assert_eq!(backend.get_calls(), 0);
    assert_eq!(backend.len("span"), 2);
}

#[tokio::test]
async fn test_sums_accumulate_across_ticks() {
    let backend = MemoryBackend::new();
    let engine = engine(&backend);

    for tick in 0..3i64 {
        for slow in [10i32, 40, 25] {
            let record = Record::new("svc", vec![Value::from(1i64 + tick), Value::from(slow)]);
            engine.registry().tell("call_count", record).await.expect("tell");
        }
        drain_queues(&engine);

        let report = engine.timer().tick().await;
        assert_eq!(report.inserts + report.updates, 1);
    }

    // 3 * 1 + 3 * 2 + 3 * 3
    let stored = backend.record("call_count", "svc").expect("stored");
    assert_eq!(stored.get(0), Some(&Value::Int64(18)));
    assert_eq!(stored.get(1), Some(&Value::Int32(40)));
    assert_eq!(backend.inserts(), 1);
    assert_eq!(backend.updates(), 2);
}

#[tokio::test]
async fn test_merges_with_previously_stored_entity() {
    let backend = MemoryBackend::new();
    backend.seed(
        "call_count",
        Record::new("svc", vec![Value::from(100i64), Value::from(90i32)]),
    );
    let engine = engine(&backend);

    let record = Record::new("svc", vec![Value::from(7i64), Value::from(30i32)]);
    engine.registry().tell("call_count", record).await.expect("tell");
    drain_queues(&engine);

    let report = engine.timer().tick().await;
    assert_eq!(report.updates, 1);

    let stored = backend.record("call_count", "svc").expect("stored");
    assert_eq!(stored.get(0), Some(&Value::Int64(107)));
    assert_eq!(stored.get(1), Some(&Value::Int32(90)));
}

#[tokio::test]
async fn test_records_during_flush_land_in_next_tick() {
    let backend = MemoryBackend::new();
    let engine = engine(&backend);

    engine.registry().tell("endpoint_hits", hits("A", 1)).await.expect("tell");
    drain_queues(&engine);

    // Swap by hand so a record can arrive while the first buffer is held.
    let worker = engine
        .workers()
        .iter()
        .find(|w| w.role().name == "endpoint_hits" && w.window().active_len() == 1)
        .expect("worker with record");
    let held = worker.flush_and_switch().expect("swap");

    worker.absorb(hits("B", 2));
    assert!(worker.flush_and_switch().is_err());

    let batch = worker
        .build_batch_collection(&held)
        .await
        .expect("batch");
    assert_eq!(batch.inserts, 1);
    worker.release(held);

    let report = engine.timer().tick().await;
    assert_eq!(report.inserts, 1);
    assert!(backend.record("endpoint_hits", "B").is_some());
}

#[tokio::test]
async fn test_unknown_role_is_rejected() {
    let backend = MemoryBackend::new();
    let engine = engine(&backend);

    let err = engine
        .registry()
        .tell("missing", hits("A", 1))
        .await
        .expect_err("unknown role");
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
async fn test_stop_flushes_everything_accepted() {
    let backend = MemoryBackend::new();
    let mut engine = engine(&backend);
    engine.start().await.expect("start");

    for i in 0..60i32 {
        let id = format!("span-{i}");
        let record = Record::new(id.as_str(), vec![Value::from(id.as_str()), Value::from(i)]);
        let delivery = engine.registry().tell("span", record).await.expect("tell");
        assert_eq!(delivery, Delivery::Enqueued);
    }

    engine.stop().await.expect("stop");

    assert_eq!(backend.len("span"), 60);
}

#[tokio::test]
async fn test_default_catalog_builds_an_engine() {
    let cfg = Config::from_yaml("storage:\n  backend: memory\n").expect("config");
    let engine = EngineContext::build(&cfg, MemoryBackend::new(), None).expect("engine");

    let names: Vec<String> = engine
        .registry()
        .roles()
        .iter()
        .map(|role| role.name.clone())
        .collect();
    assert!(names.contains(&"service_metric".to_string()));
    assert!(names.contains(&"segment".to_string()));
}

#[tokio::test]
async fn test_service_metric_collapses_per_minute_bucket() {
    use aggregoor::model::time_bucket::{entity_id, Downsampling};

    let cfg = Config::from_yaml("timer:\n  initial_delay: 1h\n  period: 1h\n").expect("config");
    let backend = MemoryBackend::new();
    let engine = EngineContext::build(&cfg, backend.clone(), None).expect("engine");

    // 17:42:05 and 17:42:50 share a minute bucket, 17:43:01 does not.
    let base = 1_709_660_525_000i64;
    for (offset_ms, duration) in [(0, 120i64), (45_000, 30), (56_000, 75)] {
        let bucket = Downsampling::Minute
            .bucket_from_millis(base + offset_ms)
            .expect("bucket");
        let values = vec![
            Value::from(7i32),
            Value::from(bucket),
            Value::from(1i64),
            Value::from(0i64),
            Value::from(duration),
            Value::from(0i64),
            Value::from(duration),
            Value::from(duration),
            Value::from(1i64),
            Value::from(0i64),
            Value::from(0i64),
        ];

        let record = Record::new(entity_id(bucket, "7"), values);
        engine
            .registry()
            .tell("service_metric", record)
            .await
            .expect("tell");
    }
    drain_queues(&engine);

    let report = engine.timer().tick().await;
    assert_eq!(report.inserts, 2);

    let first = Downsampling::Minute.bucket_from_millis(base).expect("bucket");
    let stored = backend
        .record("service_metric", &entity_id(first, "7"))
        .expect("stored");
    assert_eq!(stored.get(2), Some(&Value::Int64(2)));
    assert_eq!(stored.get(4), Some(&Value::Int64(150)));
    assert_eq!(stored.get(6), Some(&Value::Int64(30)));
    assert_eq!(stored.get(7), Some(&Value::Int64(120)));
}
