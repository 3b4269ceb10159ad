//! Event bus publish throughput benchmark.
//!
//! Measures publish latency as the number of matching subscribers grows,
//! and the cost of pattern matching against many non-matching ones.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hub_core::bus::{handler_fn, EventBus};
use serde_json::json;

fn bench_publish_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let subscriber_counts: &[usize] = &[1, 8, 64, 256];

    let mut group = c.benchmark_group("publish_fanout");
    for &count in subscriber_counts {
        let bus = EventBus::new();
        rt.block_on(async {
            for i in 0..count {
                let pattern = if i % 2 == 0 { "devices.*" } else { "devices.lamp.on" };
                bus.subscribe(pattern, handler_fn(|_event| async { Ok(()) }))
                    .await
                    .unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(count), &bus, |b, bus| {
            b.iter(|| {
                rt.block_on(async {
                    bus.publish(black_box("devices.lamp.on"), json!({"brightness": 80}))
                        .await
                        .unwrap()
                })
            });
        });
    }
    group.finish();
}

fn bench_publish_filtered(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let bus = EventBus::new();
    rt.block_on(async {
        for i in 0..1024 {
            let pattern = format!("vendor{}.*", i);
            bus.subscribe(&pattern, handler_fn(|_event| async { Ok(()) }))
                .await
                .unwrap();
        }
        bus.subscribe("external.*", handler_fn(|_event| async { Ok(()) }))
            .await
            .unwrap();
    });

    c.bench_function("publish_one_of_1025", |b| {
        b.iter(|| {
            rt.block_on(async {
                bus.publish(black_box("external.device_discovered"), json!({}))
                    .await
                    .unwrap()
            })
        });
    });
}

criterion_group!(benches, bench_publish_fanout, bench_publish_filtered);
criterion_main!(benches);
