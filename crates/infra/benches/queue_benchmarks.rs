use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use taskq_core::{EnqueueOptions, Payload, RetryPolicy, TaskType, WorkerId};
use taskq_infra::queue::{
    HandlerRegistry, InMemoryTaskStore, PollLoop, PollLoopConfig, TaskStore, handler_fn,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn filled_store(rt: &tokio::runtime::Runtime, tasks: usize) -> Arc<InMemoryTaskStore> {
    let store = InMemoryTaskStore::arc();
    let now = Utc::now();
    rt.block_on(async {
        for n in 0..tasks {
            store
                .enqueue(
                    TaskType::Matching,
                    Payload::new(serde_json::json!({ "cv": n })),
                    EnqueueOptions::default().with_priority((n % 10) as i32),
                    now,
                )
                .await
                .unwrap();
        }
    });
    store
}

/// Claim every task in a queue of the given depth.
fn bench_claim_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_drain");

    for depth in [100usize, 1_000, 5_000] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let worker = WorkerId::new("bench").unwrap();
            b.iter_batched(
                || filled_store(&rt, depth),
                |store| {
                    rt.block_on(async {
                        let now = Utc::now();
                        while let Some(task) = store.claim(&worker, now).await.unwrap() {
                            black_box(task);
                        }
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Full tick: reap, claim, dispatch, write the outcome.
fn bench_tick(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("poll_loop_tick");
    group.throughput(Throughput::Elements(1));

    group.bench_function("echo_handler", |b| {
        let registry = HandlerRegistry::new()
            .with(TaskType::Matching, handler_fn(|p| async { Ok(p) }))
            .unwrap();
        b.iter_batched(
            || {
                PollLoop::new(
                    WorkerId::new("bench").unwrap(),
                    filled_store(&rt, 1),
                    Arc::new(registry.clone()),
                    PollLoopConfig::default(),
                )
            },
            |lp| rt.block_on(async { black_box(lp.tick().await) }),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::exponential(Duration::from_secs(5)).with_max_delay(Duration::from_secs(3600));
    let now = Utc::now();

    c.bench_function("retry_policy_on_failure", |b| {
        b.iter(|| {
            for attempts in 1..=20u32 {
                black_box(policy.on_failure(black_box(attempts), 20, now));
            }
        })
    });
}

criterion_group!(benches, bench_claim_drain, bench_tick, bench_backoff);
criterion_main!(benches);
