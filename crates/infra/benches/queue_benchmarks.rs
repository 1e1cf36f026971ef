use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use conveyor_core::{ContentType, Payload, Serializer, WorkQueue};
use conveyor_infra::background::{BackgroundQueue, Callable, QueueConfig};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn sample_payload() -> Payload {
    Payload::from_json(json!({
        "order_id": "ord-1042",
        "lines": [
            {"sku": "A-1", "qty": 3, "price": 12.5},
            {"sku": "B-7", "qty": 1, "price": 99.0},
        ],
        "customer": {"id": 77, "tier": "gold"},
        "notes": "leave at the door",
    }))
}

fn bench_serializer(c: &mut Criterion) {
    let mut group = c.benchmark_group("serializer");
    let serializer = Serializer::new();
    let payload = sample_payload();

    for content_type in [ContentType::Json, ContentType::MsgPack] {
        let body = serializer.encode_as(&payload, content_type).unwrap();
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("encode", content_type.mime()),
            &content_type,
            |b, ct| b.iter(|| serializer.encode_as(black_box(&payload), *ct).unwrap()),
        );
        group.bench_with_input(
            BenchmarkId::new("decode", content_type.mime()),
            &body,
            |b, body| {
                b.iter(|| {
                    serializer
                        .decode(black_box(body), Some(content_type.mime()))
                        .unwrap()
                })
            },
        );
    }

    group.finish();
}

fn bench_work_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_queue");

    for batch in [16usize, 256, 4096] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("put_get", batch), &batch, |b, &batch| {
            let queue = WorkQueue::new(batch);
            b.iter(|| {
                for i in 0..batch {
                    queue.try_put(i).unwrap();
                }
                while let Some(item) = queue.try_get() {
                    black_box(item);
                    queue.task_done();
                }
            })
        });
    }

    group.finish();
}

fn bench_background_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("background_queue");
    group.sample_size(20);
    let rt = tokio::runtime::Runtime::new().unwrap();

    for workers in [1usize, 4] {
        let batch = 200;
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("drain", workers), &workers, |b, &workers| {
            b.iter(|| {
                rt.block_on(async {
                    let config = QueueConfig::default()
                        .with_max_size(batch)
                        .with_workers(workers)
                        .with_put_delay(Duration::ZERO);
                    let queue = BackgroundQueue::new(config);
                    let done = Arc::new(AtomicUsize::new(0));
                    queue.start();

                    for _ in 0..batch {
                        let done = done.clone();
                        queue
                            .try_put(Callable::from_async("noop", move || {
                                let done = done.clone();
                                async move {
                                    done.fetch_add(1, Ordering::SeqCst);
                                    Ok(serde_json::Value::Null)
                                }
                            }))
                            .unwrap();
                    }
                    while done.load(Ordering::SeqCst) < batch {
                        tokio::task::yield_now().await;
                    }
                    queue.shutdown().await;
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_serializer,
    bench_work_queue,
    bench_background_queue
);
criterion_main!(benches);
