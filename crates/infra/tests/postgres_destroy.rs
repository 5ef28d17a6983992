//! Wipes the whole `documents` table, so it lives in its own test binary and
//! never overlaps with the other Postgres tests.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p jobdoc-infra -- --ignored`.

use std::time::Duration;

use jobdoc_infra::{JobStorage, StorageOptions};

#[test]
#[ignore = "requires DATABASE_URL"]
fn destroyed_store_stays_usable_without_setup() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for Postgres tests");
    let storage = JobStorage::open(StorageOptions::default().with_database_url(url))
        .expect("failed to open Postgres storage");

    let mut tx = storage.create_write_transaction();
    tx.increment_counter("destroy-check").unwrap();
    tx.commit().unwrap();

    storage.repository().destroy().unwrap();
    assert_eq!(storage.connection().get_counter("destroy-check").unwrap(), 0);

    let mut tx = storage.create_write_transaction();
    tx.increment_counter_with_expiry("destroy-check", Duration::from_secs(60)).unwrap();
    tx.commit().unwrap();
    assert_eq!(storage.connection().get_counter("destroy-check").unwrap(), 1);
}
