//! Broker contract against a live Redis.
//!
//! Ignored by default. Run with
//! `REDIS_URL=redis://127.0.0.1:6379/ cargo test --test redis_broker -- --ignored`.

use std::time::{Duration, Instant};

use echo_monitor::broker::{Broker, RedisBroker};
use echo_monitor::error::BrokerError;

const NO_WAIT: Duration = Duration::from_millis(1);

async fn broker() -> RedisBroker {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
    RedisBroker::connect(&url).await.expect("redis reachable at REDIS_URL")
}

/// Fresh stream name so runs never see each other's entries.
fn stream() -> String {
    format!("echo-test:{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "needs a running Redis (REDIS_URL)"]
async fn every_group_receives_every_entry() {
    let broker = broker().await;
    let stream = stream();
    broker.create_group(&stream, "IND").await.unwrap();
    broker.create_group(&stream, "USA").await.unwrap();

    let id = broker.append(&stream, "hello").await.unwrap();

    for group in ["IND", "USA"] {
        let got = broker.read_group(&stream, group, "c1", 10, NO_WAIT).await.unwrap();
        assert_eq!(got.len(), 1, "group {group}");
        assert_eq!(got[0].id, id);
        assert_eq!(got[0].payload, "hello");
    }
}

#[tokio::test]
#[ignore = "needs a running Redis (REDIS_URL)"]
async fn consumers_in_one_group_split_the_work() {
    let broker = broker().await;
    let stream = stream();
    broker.create_group(&stream, "IND").await.unwrap();
    for n in 0..4 {
        broker.append(&stream, &n.to_string()).await.unwrap();
    }

    let a = broker.read_group(&stream, "IND", "a", 2, NO_WAIT).await.unwrap();
    let b = broker.read_group(&stream, "IND", "b", 10, NO_WAIT).await.unwrap();

    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
    assert!(a.iter().all(|m| !b.contains(m)));
    assert_eq!(broker.pending_count(&stream, "IND").await.unwrap(), 4);
}

#[tokio::test]
#[ignore = "needs a running Redis (REDIS_URL)"]
async fn ack_shrinks_the_pending_set() {
    let broker = broker().await;
    let stream = stream();
    broker.create_group(&stream, "db-writer").await.unwrap();
    broker.append(&stream, "x").await.unwrap();
    broker.append(&stream, "y").await.unwrap();

    let got = broker.read_group(&stream, "db-writer", "w1", 10, NO_WAIT).await.unwrap();
    assert_eq!(broker.pending_count(&stream, "db-writer").await.unwrap(), 2);

    let acked = broker.ack(&stream, "db-writer", &[got[0].id.clone()]).await.unwrap();
    assert_eq!(acked, 1);
    assert_eq!(broker.pending_count(&stream, "db-writer").await.unwrap(), 1);

    // Acking the same id again is a no-op
    assert_eq!(broker.ack(&stream, "db-writer", &[got[0].id.clone()]).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "needs a running Redis (REDIS_URL)"]
async fn creating_an_existing_group_is_not_an_error() {
    let broker = broker().await;
    let stream = stream();
    broker.create_group(&stream, "IND").await.unwrap();
    broker.append(&stream, "kept").await.unwrap();

    broker.create_group(&stream, "IND").await.unwrap();

    // The second create did not move the group to the tail
    let got = broker.read_group(&stream, "IND", "c1", 10, NO_WAIT).await.unwrap();
    assert_eq!(got.len(), 1);
}

#[tokio::test]
#[ignore = "needs a running Redis (REDIS_URL)"]
async fn blocking_read_times_out_empty() {
    let broker = broker().await;
    let stream = stream();
    broker.create_group(&stream, "IND").await.unwrap();

    let started = Instant::now();
    let got = broker
        .read_group(&stream, "IND", "c1", 10, Duration::from_millis(100))
        .await
        .unwrap();

    assert!(got.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[tokio::test]
#[ignore = "needs a running Redis (REDIS_URL)"]
async fn pending_entries_are_replayed_to_their_owner_only() {
    let broker = broker().await;
    let stream = stream();
    broker.create_group(&stream, "IND").await.unwrap();
    let first = broker.append(&stream, "1").await.unwrap();
    let second = broker.append(&stream, "2").await.unwrap();
    broker.read_group(&stream, "IND", "a", 10, NO_WAIT).await.unwrap();

    let replay = broker.read_pending(&stream, "IND", "a", "0", 10).await.unwrap();
    let ids: Vec<_> = replay.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec![first.clone(), second.clone()]);
    assert_eq!(replay[1].payload, "2");

    let rest = broker.read_pending(&stream, "IND", "a", &first, 10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, second);

    assert!(broker.read_pending(&stream, "IND", "b", "0", 10).await.unwrap().is_empty());

    broker.ack(&stream, "IND", &ids).await.unwrap();
    assert!(broker.read_pending(&stream, "IND", "a", "0", 10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "needs a running Redis (REDIS_URL)"]
async fn reading_a_missing_group_is_no_such_group() {
    let broker = broker().await;
    let stream = stream();
    broker.create_group(&stream, "IND").await.unwrap();

    let err = broker
        .read_group(&stream, "USA", "c1", 10, NO_WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoSuchGroup { ref group, .. } if group == "USA"), "{err:?}");

    let err = broker.read_pending(&stream, "USA", "c1", "0", 10).await.unwrap_err();
    assert!(matches!(err, BrokerError::NoSuchGroup { .. }), "{err:?}");
}
