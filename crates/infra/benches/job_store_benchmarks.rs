use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use audioflow_core::{GuestId, UserId};
use audioflow_infra::store::{InMemoryJobStore, JobFilter, JobStore, UsageLedger};
use audioflow_jobs::{JobTransition, NewJob, Owner, ProcessingType, UsageDelta};
use chrono::{Duration, Utc};
use tokio::runtime::Runtime;

fn new_job(owner: Owner) -> NewJob {
    NewJob {
        owner,
        original_filename: "bench.wav".to_string(),
        stored_filename: "bench-stored.wav".to_string(),
        file_format: "wav".to_string(),
        file_size: 1024 * 1024,
        processing_type: ProcessingType::SpeechEnhancement,
        input_location: "/tmp/bench-stored.wav".to_string(),
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// create → claim → complete, with both usage increments.
fn bench_job_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_lifecycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("create_claim_complete", |b| {
        let store = InMemoryJobStore::new();
        let owner = Owner::User(UserId::new());
        b.to_async(&rt).iter(|| async {
            let now = Utc::now();
            let job = store.create(new_job(owner.clone()), now, Duration::hours(24)).await.unwrap();
            store.transition(job.job_id, JobTransition::Claim { at: now }).await.unwrap();
            let done = store
                .transition(
                    job.job_id,
                    JobTransition::Complete {
                        output_location: "/tmp/out.wav".to_string(),
                        output_bytes: black_box(512 * 1024),
                        at: Utc::now(),
                    },
                )
                .await
                .unwrap();
            black_box(done);
        });
    });

    group.bench_function("rejected_duplicate_claim", |b| {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = rt
            .block_on(store.create(new_job(Owner::Guest(GuestId::generate())), now, Duration::hours(24)))
            .unwrap();
        rt.block_on(store.transition(job.job_id, JobTransition::Claim { at: now })).unwrap();

        b.to_async(&rt).iter(|| async {
            let rejected = store.transition(job.job_id, JobTransition::Claim { at: Utc::now() }).await;
            black_box(rejected.is_err());
        });
    });

    group.finish();
}

/// Concurrent usage increments against a single owner row.
fn bench_usage_increment(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("usage_increment");

    for writers in [1usize, 4, 16] {
        group.throughput(Throughput::Elements(writers as u64));
        group.bench_with_input(BenchmarkId::new("concurrent_writers", writers), &writers, |b, &n| {
            let store = std::sync::Arc::new(InMemoryJobStore::new());
            let owner = Owner::Guest(GuestId::generate());
            b.to_async(&rt).iter(|| {
                let store = store.clone();
                let owner = owner.clone();
                async move {
                    let tasks: Vec<_> = (0..n)
                        .map(|_| {
                            let store = store.clone();
                            let owner = owner.clone();
                            tokio::spawn(async move {
                                let now = Utc::now();
                                store.increment(&owner, &UsageDelta::api_call(now), now).await.unwrap();
                            })
                        })
                        .collect();
                    for t in tasks {
                        t.await.unwrap();
                    }
                }
            });
        });
    }

    group.finish();
}

/// Admin listing over a populated store.
fn bench_admin_listing(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("admin_listing");

    for total in [100usize, 1_000, 10_000] {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        rt.block_on(async {
            for i in 0..total {
                let owner = if i % 2 == 0 {
                    Owner::User(UserId::new())
                } else {
                    Owner::Guest(GuestId::generate())
                };
                store.create(new_job(owner), now, Duration::hours(24)).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::new("first_page", total), &total, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(store.list(&JobFilter::default()).await.unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_job_lifecycle, bench_usage_increment, bench_admin_listing);
criterion_main!(benches);
