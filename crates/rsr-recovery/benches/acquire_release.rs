#![forbid(unsafe_code)]
//! Benchmark: guard acquire/release on the registry hot path.
//!
//! Scenarios:
//! 1. Single thread, one session
//! 2. N threads hammering one session
//! 3. N threads on N sessions

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rsr_recovery::{RecoveryOutcome, RecoveryRegistry, RecoveryRequest, RegistryConfig};
use rsr_store::{Closeable, RefCountedResource, Store};
use rsr_types::{NodeId, RecoveryId, ShardId};
use std::sync::{Arc, Barrier};

const OPS_PER_THREAD: u64 = 10_000;

struct NullStore;

impl Closeable for NullStore {
    fn close(&self) -> rsr_error::Result<()> {
        Ok(())
    }
}

impl Store for NullStore {
    fn delete_files(&self, _names: &[String]) -> rsr_error::Result<()> {
        Ok(())
    }
}

fn populate(
    registry: &RecoveryRegistry<NullStore>,
    store: &RefCountedResource<NullStore>,
    sessions: u32,
) -> Vec<RecoveryId> {
    (0..sessions)
        .map(|shard| {
            registry
                .register_default(RecoveryRequest::new(
                    ShardId::new("bench", shard),
                    NodeId::new("source"),
                    NodeId::new("target"),
                    store.acquire().expect("store"),
                    |_: RecoveryOutcome| {},
                ))
                .expect("register")
        })
        .collect()
}

fn run_threads(registry: &RecoveryRegistry<NullStore>, ids: &[RecoveryId], threads: usize) {
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();
    for tid in 0..threads {
        let registry = registry.clone();
        let barrier = Arc::clone(&barrier);
        let id = ids[tid % ids.len()];
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            for _ in 0..OPS_PER_THREAD {
                let guard = registry.acquire(id).expect("registered");
                std::hint::black_box(guard.generation());
            }
        }));
    }
    for h in handles {
        h.join().expect("no panic");
    }
}

fn bench_single_thread(c: &mut Criterion) {
    let registry = RecoveryRegistry::new(RegistryConfig::default()).expect("registry");
    let store = RefCountedResource::new("store", NullStore);
    let ids = populate(&registry, &store, 1);
    c.bench_function("acquire_release/single", |b| {
        b.iter(|| {
            let guard = registry.acquire(ids[0]).expect("registered");
            std::hint::black_box(guard.id());
        });
    });
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_release/contended");
    for threads in [2_usize, 4, 8] {
        let registry = RecoveryRegistry::new(RegistryConfig::default()).expect("registry");
        let store = RefCountedResource::new("store", NullStore);
        let shared = populate(&registry, &store, 1);
        let spread = {
            let registry = RecoveryRegistry::new(RegistryConfig::default()).expect("registry");
            let ids = populate(&registry, &store, u32::try_from(threads).expect("small"));
            (registry, ids)
        };

        group.bench_with_input(BenchmarkId::new("one_session", threads), &threads, |b, &t| {
            b.iter(|| run_threads(&registry, &shared, t));
        });
        group.bench_with_input(
            BenchmarkId::new("session_per_thread", threads),
            &threads,
            |b, &t| {
                b.iter(|| run_threads(&spread.0, &spread.1, t));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_single_thread, bench_contended);
criterion_main!(benches);
