//! Black-box tests against a live Postgres.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p jobdoc-infra -- --ignored`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use jobdoc_core::{InvocationData, JobId, StateData, state_names};
use jobdoc_infra::{CancellationToken, JobStorage, StorageOptions};
use serde_json::json;

fn open() -> JobStorage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for Postgres tests");
    let options = StorageOptions::default()
        .with_database_url(url)
        .with_queue_poll_interval(Duration::from_millis(50));
    JobStorage::open(options).expect("failed to open Postgres storage")
}

/// Keys unique to one test run so parallel runs do not collide.
fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", JobId::generate())
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn job_round_trips_through_postgres_queue() {
    let storage = open();
    let queue = unique("queue");
    let connection = storage.connection();

    let invocation = InvocationData::new("Console", "WriteLine", &["System.String"], &[json!("pg")]).unwrap();
    let job_id = connection
        .create_expired_job(invocation, BTreeMap::new(), Utc::now(), Duration::from_secs(3600))
        .unwrap();

    let mut tx = storage.create_write_transaction();
    tx.set_job_state(&job_id, &StateData::new(state_names::ENQUEUED)).unwrap();
    tx.add_to_queue(&queue, &job_id).unwrap();
    tx.commit().unwrap();

    let mut lease = connection
        .fetch_next_job(&[queue.as_str()], &CancellationToken::new())
        .unwrap();
    assert_eq!(lease.job_id(), &job_id);
    lease.acknowledge().unwrap();

    assert_eq!(storage.monitoring_api().enqueued_count(&queue).unwrap(), 0);
    assert_eq!(
        connection.get_state_data(&job_id).unwrap().map(|s| s.name),
        Some(state_names::ENQUEUED.to_string())
    );
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn counters_and_hashes_persist_in_postgres() {
    let storage = open();
    let counter = unique("stats:succeeded");
    let hash = unique("recurring-job");

    for _ in 0..3 {
        let mut tx = storage.create_write_transaction();
        tx.increment_counter_with_expiry(&counter, Duration::from_secs(3600)).unwrap();
        tx.commit().unwrap();
    }

    let mut tx = storage.create_write_transaction();
    tx.set_range_in_hash(&hash, [("Cron", "* * * * *")]).unwrap();
    tx.expire_hash(&hash, Duration::from_secs(3600)).unwrap();
    tx.commit().unwrap();

    let connection = storage.connection();
    assert_eq!(connection.get_counter(&counter).unwrap(), 3);
    assert_eq!(connection.get_value_from_hash(&hash, "Cron").unwrap().as_deref(), Some("* * * * *"));
    assert!(connection.get_hash_ttl(&hash).unwrap().is_some());
}
