use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use stream_chain::{from_array, from_string, run_local, Blackhole, Context};
use tokio::runtime::{Builder, Runtime};

fn runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Runtime failed")
}

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("single_stage_1000_objects", |b| {
        b.iter(|| {
            rt.block_on(run_local(async {
                let ctx = Context::new();
                from_array(&ctx, (0..1000i64).map(black_box))
                    .pipe(Blackhole::node(&ctx, true))
                    .into_future()
                    .await
                    .expect("Pipeline failed");
            }))
        });
    });
}

fn benchmark_three_stage_throughput(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("three_stage_1000_objects", |b| {
        b.iter(|| {
            rt.block_on(run_local(async {
                let ctx = Context::new();
                let out = from_array(&ctx, (0..1000i64).map(black_box))
                    .through_sync(Ok)
                    .filter(|_| true)
                    .batch(10)
                    .into_array()
                    .await
                    .expect("Pipeline failed");
                assert_eq!(out.len(), 100);
            }))
        });
    });
}

fn benchmark_byte_split_throughput(c: &mut Criterion) {
    let rt = runtime();
    let text: String = (0..5000).map(|i| format!("line {}\n", i)).collect();
    c.bench_function("split_5000_lines", |b| {
        b.iter(|| {
            rt.block_on(run_local(async {
                let ctx = Context::new();
                let out = from_string(&ctx, black_box(text.clone()), 4096)
                    .split_lines()
                    .into_array()
                    .await
                    .expect("Pipeline failed");
                assert_eq!(out.len(), 5000);
            }))
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_single_stage_throughput,
        benchmark_three_stage_throughput,
        benchmark_byte_split_throughput
);
criterion_main!(benches);
