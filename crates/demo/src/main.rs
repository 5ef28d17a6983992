//! Console sample: a producer enqueues a handful of jobs, two workers lease,
//! "perform" and complete them, then the monitoring view is printed.
//!
//! Uses Postgres when `DATABASE_URL` is set, the in-memory store otherwise.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use jobdoc_core::{InvocationData, JobId, ServerData, StateData, state_names};
use jobdoc_infra::monitoring::{daily_stats_key, hourly_stats_key};
use jobdoc_infra::{
    CancellationToken, FetchedJob, JobStorage, QueueError, StorageOptions, StoreError,
    WriteOnlyTransaction,
};

const SERVER_ID: &str = "demo-server";
const COMMIT_ATTEMPTS: usize = 5;

/// Build and commit a transaction, rebuilding it on concurrency conflicts.
fn commit_with_retry<F>(storage: &JobStorage, build: F) -> Result<()>
where
    F: Fn(&mut WriteOnlyTransaction) -> Result<(), StoreError>,
{
    let mut attempt = 1;
    loop {
        let mut tx = storage.create_write_transaction();
        build(&mut tx)?;
        match tx.commit() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < COMMIT_ATTEMPTS => {
                warn!(attempt, error = %e, "commit conflict, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn enqueue(storage: &JobStorage, queue: &str, message: &str) -> Result<JobId> {
    let invocation = InvocationData::new("Console", "WriteLine", &["System.String"], &[json!(message)])?;
    let job_id = storage.connection().create_expired_job(
        invocation,
        BTreeMap::new(),
        Utc::now(),
        Duration::from_secs(3600),
    )?;

    let enqueued = StateData::new(state_names::ENQUEUED)
        .with_data("EnqueuedAt", Utc::now().to_rfc3339())
        .with_data("Queue", queue);
    commit_with_retry(storage, |tx| {
        tx.set_job_state(&job_id, &enqueued)?;
        tx.persist_job(&job_id)?;
        tx.add_to_queue(queue, &job_id)
    })?;
    Ok(job_id)
}

fn perform(storage: &JobStorage, worker: usize, lease: &mut Box<dyn FetchedJob>) -> Result<()> {
    let job_id = lease.job_id().clone();
    let started = Utc::now();

    commit_with_retry(storage, |tx| {
        let processing = StateData::new(state_names::PROCESSING)
            .with_data("StartedAt", started.to_rfc3339())
            .with_data("ServerId", SERVER_ID)
            .with_data("WorkerId", worker.to_string());
        tx.set_job_state(&job_id, &processing)
    })?;

    let data = storage
        .connection()
        .get_job_data(&job_id)?
        .context("leased job vanished")?;
    match data.job {
        Some(invocation) => info!(worker, job_id = %job_id, args = ?invocation.args, "performing job"),
        None => warn!(worker, job_id = %job_id, error = ?data.load_error, "job payload unreadable"),
    }

    let now = Utc::now();
    let latency = (started - now).num_milliseconds().abs();
    commit_with_retry(storage, |tx| {
        let succeeded = StateData::new(state_names::SUCCEEDED)
            .with_data("SucceededAt", now.to_rfc3339())
            .with_data("PerformanceDuration", "1")
            .with_data("Latency", latency.to_string());
        tx.set_job_state(&job_id, &succeeded)?;
        tx.expire_job(&job_id, Duration::from_secs(24 * 3600))?;
        tx.increment_counter("stats:succeeded")?;
        tx.increment_counter_with_expiry(
            &daily_stats_key("succeeded", now.date_naive()),
            Duration::from_secs(30 * 24 * 3600),
        )?;
        tx.increment_counter_with_expiry(&hourly_stats_key("succeeded", now), Duration::from_secs(24 * 3600))
    })?;

    lease.acknowledge()?;
    Ok(())
}

fn worker_loop(storage: JobStorage, worker: usize, token: CancellationToken) -> Result<usize> {
    let connection = storage.connection();
    let queues: Vec<&str> = storage.options().queues.iter().map(String::as_str).collect();
    let mut performed = 0;
    loop {
        match connection.fetch_next_job(&queues, &token) {
            Ok(mut lease) => {
                perform(&storage, worker, &mut lease)?;
                performed += 1;
            }
            Err(QueueError::Cancelled) => return Ok(performed),
            Err(e) => return Err(e.into()),
        }
    }
}

fn main() -> Result<()> {
    jobdoc_observability::init();

    let options = StorageOptions::from_env().context("invalid storage configuration")?;
    let storage = JobStorage::open(options).context("failed to open job storage")?;
    let reaper = storage.expiration_reaper().spawn().context("failed to start reaper")?;

    let connection = storage.connection();
    connection.announce_server(
        SERVER_ID,
        ServerData {
            worker_count: 2,
            queues: storage.options().queues.clone(),
            started_at: Some(Utc::now()),
        },
    )?;

    let token = CancellationToken::new();
    let workers: Vec<_> = (0..2)
        .map(|worker| {
            let storage = storage.clone();
            let token = token.clone();
            thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn(move || worker_loop(storage, worker, token))
        })
        .collect::<std::io::Result<_>>()?;

    let queues = storage.options().queues.clone();
    let jobs = 10;
    for i in 0..jobs {
        let queue = &queues[i % queues.len()];
        let job_id = enqueue(&storage, queue, &format!("Hello, world #{i}"))?;
        info!(job_id = %job_id, queue = %queue, "job enqueued");
    }

    let monitoring = storage.monitoring_api();
    while monitoring.succeeded_list_count()? < jobs {
        connection.heartbeat(SERVER_ID)?;
        thread::sleep(Duration::from_millis(50));
    }

    token.cancel();
    for handle in workers {
        match handle.join() {
            Ok(result) => {
                let performed = result?;
                info!(performed, "worker stopped");
            }
            Err(_) => warn!("worker thread panicked"),
        }
    }

    let stats = monitoring.get_statistics()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    for (job_id, dto) in monitoring.succeeded_jobs(0, 3)? {
        println!("{job_id}: succeeded at {:?}, total {:?} ms", dto.succeeded_at, dto.total_duration);
    }
    println!("succeeded counter: {}", connection.get_counter("stats:succeeded")?);

    connection.remove_server(SERVER_ID)?;
    reaper.shutdown();
    Ok(())
}
