use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use iox_concurrent::ResizeableLockFreeQueue;

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("resizeable_queue");
    group.throughput(Throughput::Elements(1));

    for &capacity in &[16u64, 256, 1024] {
        let queue = ResizeableLockFreeQueue::<u64, 1024>::with_capacity(capacity);
        group.bench_function(format!("push_pop_cap_{capacity}"), |b| {
            b.iter(|| {
                queue.push(black_box(1));
                black_box(queue.pop());
            });
        });
    }

    group.finish();
}

/// Push into a full queue: every push evicts the oldest value.
fn bench_overflow(c: &mut Criterion) {
    let queue = ResizeableLockFreeQueue::<u64, 64>::new();
    for i in 0..64 {
        queue.push(i);
    }

    let mut group = c.benchmark_group("resizeable_queue");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push (full, evicting)", |b| {
        b.iter(|| black_box(queue.push(black_box(7))));
    });
    group.finish();
}

fn bench_resize(c: &mut Criterion) {
    let queue = ResizeableLockFreeQueue::<u64, 256>::new();

    let mut group = c.benchmark_group("resizeable_queue");
    group.bench_function("set_capacity 256 -> 16 -> 256 (full)", |b| {
        b.iter(|| {
            while queue.try_push(3).is_ok() {}
            queue.set_capacity(16, |v| {
                black_box(v);
            });
            queue.set_capacity_discarding(256);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_overflow, bench_resize);
criterion_main!(benches);
