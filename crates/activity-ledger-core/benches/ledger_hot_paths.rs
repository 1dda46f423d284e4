//! Benchmarks for the ledger's hot paths.
//!
//! Performance budgets:
//! - Live increment (single counter upsert): **p50 < 200us**
//! - Backfill flush of 5,000 deltas: **< 50ms**
//! - Community totals over 10K counters: **< 20ms**
//! - Channel-first batch recount (4 channels x 2K messages, 50 users): **< 25ms**

use std::collections::HashSet;
use std::hint::black_box;
use std::sync::Arc;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use activity_ledger_core::Ledger;
use activity_ledger_core::cache::CountCache;
use activity_ledger_core::config::LedgerConfig;
use activity_ledger_core::counting::CountOptions;
use activity_ledger_core::model::{ChannelId, ChannelInfo, CommunityId, CountDelta, UserId};
use activity_ledger_core::retry::RetryPolicy;
use activity_ledger_core::source::memory::MemorySource;
use activity_ledger_core::storage::LedgerStore;

const C: CommunityId = CommunityId(1);

fn make_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn deltas(users: u64, channels: u64) -> Vec<CountDelta> {
    let now = Utc::now();
    (0..users)
        .flat_map(|user| {
            (0..channels).map(move |channel| CountDelta {
                user: UserId(user + 1),
                channel: ChannelId(channel + 1),
                delta: 3,
                last_message_at: Some(now),
            })
        })
        .collect()
}

fn bench_increment(c: &mut Criterion) {
    let rt = make_runtime();
    let store = LedgerStore::open_in_memory().unwrap();
    let mut user = 0u64;

    c.bench_function("store/increment", |b| {
        b.to_async(&rt).iter(|| {
            user = (user + 1) % 500;
            let store = store.clone();
            let user = UserId(user);
            async move {
                store
                    .increment_count(C, user, ChannelId(1), 1, Utc::now())
                    .await
                    .unwrap();
            }
        });
    });
}

fn bench_flush(c: &mut Criterion) {
    let rt = make_runtime();
    let mut group = c.benchmark_group("store/apply_deltas");

    for &users in &[100u64, 1_000] {
        let batch = deltas(users, 5);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch.len()), &batch, |b, batch| {
            let store = LedgerStore::open_in_memory().unwrap();
            b.to_async(&rt).iter(|| {
                let store = store.clone();
                let batch = batch.clone();
                async move { black_box(store.apply_deltas(C, batch).await.unwrap()) }
            });
        });
    }

    group.finish();
}

fn bench_community_totals(c: &mut Criterion) {
    let rt = make_runtime();
    let store = LedgerStore::open_in_memory().unwrap();
    rt.block_on(store.apply_deltas(C, deltas(1_000, 10))).unwrap();
    let excluded: HashSet<ChannelId> = [ChannelId(3)].into_iter().collect();

    c.bench_function("store/community_totals_10k", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(store.get_community_totals(C, &excluded).await.unwrap());
        });
    });
}

fn bench_batch_recount(c: &mut Criterion) {
    let rt = make_runtime();
    let source = Arc::new(MemorySource::new());
    for channel in 1..=4u64 {
        source.add_channel(C, ChannelInfo::text(channel, format!("c{channel}")));
        for user in 1..=50u64 {
            source.add_messages(ChannelId(channel), UserId(user), 40);
        }
    }
    let config = LedgerConfig::default();
    let ledger = Ledger::assemble(
        LedgerStore::open_in_memory().unwrap(),
        CountCache::open_in_memory(None).unwrap(),
        source,
        &config,
        RetryPolicy::immediate(Some(0)),
        100,
    );
    let users: Vec<UserId> = (1..=50).map(UserId).collect();

    let mut group = c.benchmark_group("counting/batch_recount");
    for &parallelism in &[1usize, 5] {
        group.bench_with_input(
            BenchmarkId::from_parameter(parallelism),
            &parallelism,
            |b, &parallelism| {
                b.to_async(&rt).iter(|| async {
                    let options = CountOptions::fresh().parallelism(parallelism);
                    black_box(
                        ledger
                            .count_messages_for_users(C, &users, &options)
                            .await
                            .unwrap(),
                    );
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_increment,
    bench_flush,
    bench_community_totals,
    bench_batch_recount
);
criterion_main!(benches);
