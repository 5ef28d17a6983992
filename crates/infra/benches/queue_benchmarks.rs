use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use jobdoc_core::JobId;
use jobdoc_infra::queue::{CancellationToken, FetchedJob};
use jobdoc_infra::{JobStorage, StorageOptions};

fn storage() -> JobStorage {
    JobStorage::in_memory(StorageOptions::default()).unwrap()
}

fn bench_enqueue_dequeue_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_dequeue_round_trip");
    group.sample_size(200);

    group.bench_function("single_job", |b| {
        let storage = storage();
        let queue = storage.default_queue().document_queue().clone();
        let token = CancellationToken::new();

        b.iter(|| {
            queue.enqueue("default", &JobId::generate()).unwrap();
            let mut lease = queue.dequeue_lease(&["default"], &token).unwrap();
            lease.acknowledge().unwrap();
            black_box(lease);
        });
    });

    group.finish();
}

fn bench_dequeue_with_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequeue_with_backlog");

    for backlog in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("lease_and_abandon", backlog), backlog, |b, &size| {
            let storage = storage();
            let queue = storage.default_queue().document_queue().clone();
            for _ in 0..size {
                queue.enqueue("default", &JobId::generate()).unwrap();
            }
            let token = CancellationToken::new();

            b.iter(|| {
                let mut lease = queue.dequeue_lease(&["default"], &token).unwrap();
                lease.abandon().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_counter_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter_transactions");

    for increments in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*increments as u64));
        group.bench_with_input(BenchmarkId::new("commit", increments), increments, |b, &n| {
            let storage = storage();
            b.iter(|| {
                let mut tx = storage.create_write_transaction();
                for _ in 0..n {
                    tx.increment_counter("stats:succeeded").unwrap();
                }
                tx.commit().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_dequeue_round_trip,
    bench_dequeue_with_backlog,
    bench_counter_transactions
);
criterion_main!(benches);
