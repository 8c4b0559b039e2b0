use std::time::Duration;

use aggregoor::config::Config;
use aggregoor::context::EngineContext;
use aggregoor::model::{Record, Value};
use aggregoor::storage::memory::MemoryBackend;
use aggregoor::worker::{Delivery, Owner};

const ROLES: &str = r#"
timer:
  initial_delay: 1h
  period: 1h
roles:
  - name: service_calls
    schema:
      version: 3
      attributes:
        - { name: service, type: string }
        - { name: calls, type: int64, merge: sum }
        - { name: error, type: bool, merge: cover }
        - { name: payload, type: bytes }
"#;

fn record(calls: i64) -> Record {
    Record::new(
        "checkout",
        vec![
            Value::from("checkout"),
            Value::from(calls),
            Value::from(true),
            Value::from(vec![0xde, 0xad]),
        ],
    )
}

async fn wait_for_buffered(engine: &EngineContext<MemoryBackend>, expected: usize) {
    for _ in 0..200 {
        let buffered: usize = engine
            .workers()
            .iter()
            .map(|w| w.window().active_len() + w.queue().len())
            .sum();
        if buffered >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("forwarded records never arrived");
}

#[tokio::test]
async fn test_forwarded_records_are_aggregated_by_owner() {
    let owner_backend = MemoryBackend::new();
    let owner_cfg = Config::from_yaml(&format!("{ROLES}cluster:\n  listen: \"127.0.0.1:0\"\n"))
        .expect("owner config");
    let mut owner = EngineContext::build(&owner_cfg, owner_backend.clone(), None).expect("owner");
    let addr = owner.start().await.expect("start").expect("listen address");

    let sender_backend = MemoryBackend::new();
    let sender_cfg = Config::from_yaml(&format!(
        "{ROLES}cluster:\n  remote_roles:\n    service_calls: \"{addr}\"\n"
    ))
    .expect("sender config");
    let sender = EngineContext::build(&sender_cfg, sender_backend.clone(), None).expect("sender");

    assert_eq!(
        sender.registry().owner("service_calls"),
        Some(Owner::Remote(addr.to_string()))
    );

    for calls in [2, 3] {
        let delivery = sender
            .registry()
            .tell("service_calls", record(calls))
            .await
            .expect("tell");
        assert_eq!(delivery, Delivery::Forwarded);
    }

    // Both records share an id, so they collapse into one buffered entity.
    wait_for_buffered(&owner, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    owner.stop().await.expect("stop");

    let stored = owner_backend
        .record("service_calls", "checkout")
        .expect("owner stored the entity");
    assert_eq!(stored.get(1), Some(&Value::Int64(5)));
    assert_eq!(stored.get(2), Some(&Value::Bool(true)));
    assert_eq!(stored.get(3), Some(&Value::Bytes(vec![0xde, 0xad])));
    assert_eq!(sender_backend.len("service_calls"), 0);
}

#[tokio::test]
async fn test_reassign_back_to_local() {
    let backend = MemoryBackend::new();
    let cfg = Config::from_yaml(&format!(
        "{ROLES}cluster:\n  remote_roles:\n    service_calls: \"127.0.0.1:1\"\n"
    ))
    .expect("config");
    let engine = EngineContext::build(&cfg, backend.clone(), None).expect("engine");

    engine
        .registry()
        .reassign("service_calls", Owner::Local)
        .expect("reassign");

    let delivery = engine
        .registry()
        .tell("service_calls", record(1))
        .await
        .expect("tell");
    assert_eq!(delivery, Delivery::Enqueued);
}

#[tokio::test]
async fn test_unreachable_owner_reports_forward_error() {
    let cfg = Config::from_yaml(&format!(
        "{ROLES}cluster:\n  connect_timeout: 200ms\n  remote_roles:\n    service_calls: \"127.0.0.1:1\"\n"
    ))
    .expect("config");
    let engine = EngineContext::build(&cfg, MemoryBackend::new(), None).expect("engine");

    let err = engine
        .registry()
        .tell("service_calls", record(1))
        .await
        .expect_err("connection refused");
    assert!(err.to_string().contains("service_calls"));
}
