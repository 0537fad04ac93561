// Benchmarks for quorum lock acquisition
// Measures an uncontended lock/release round trip over in-memory stores

use std::hint::black_box;
use std::sync::Arc;

use batata_lock::{
    LockConfiguration, LockStore, LockStoreRef, MemoryLockStore, QuorumLockCoordinator,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn coordinator(stores: usize) -> QuorumLockCoordinator {
    let refs: Vec<LockStoreRef> = (0..stores)
        .map(|_| Arc::new(MemoryLockStore::new()) as Arc<dyn LockStore>)
        .collect();
    QuorumLockCoordinator::new(refs).unwrap()
}

fn bench_lock_release(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let config = LockConfiguration::new(30000).unwrap().with_max_retries(0);

    let mut group = c.benchmark_group("lock_release");
    for stores in [1usize, 3, 5, 7] {
        let coordinator = coordinator(stores);
        group.bench_with_input(BenchmarkId::from_parameter(stores), &stores, |b, _| {
            b.to_async(&runtime).iter(|| async {
                black_box(coordinator.lock("bench", "key", &config).await);
                coordinator.release("bench:key").await;
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lock_release);
criterion_main!(benches);
