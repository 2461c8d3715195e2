use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use iox_perf::{make_test_object, temp_shm_path};
use iox_samples::{RadarPublisher, RadarSegment, RadarSubscriber};
use std::sync::Arc;

fn bench_send_no_subscriber(c: &mut Criterion) {
    let path = temp_shm_path("crit_send");
    let segment = Arc::new(RadarSegment::create(&path).expect("failed to create segment"));
    let publisher = RadarPublisher::new(Arc::clone(&segment));
    let object = make_test_object();

    let mut group = c.benchmark_group("chunk");
    group.throughput(Throughput::Elements(1));
    group.bench_function("send (no subscriber)", |b| {
        b.iter(|| black_box(publisher.send(black_box(object))));
    });

    drop(group);
    drop(publisher);
    drop(segment);
    let _ = std::fs::remove_file(&path);
}

fn bench_round_trip(c: &mut Criterion) {
    let path = temp_shm_path("crit_rt");
    let segment = Arc::new(RadarSegment::create(&path).expect("failed to create segment"));
    let publisher = RadarPublisher::new(Arc::clone(&segment));
    let object = make_test_object();

    let mut group = c.benchmark_group("chunk");
    group.throughput(Throughput::Elements(1));

    for subscribers in 1..=4 {
        let attached: Vec<RadarSubscriber> = (0..subscribers)
            .map(|_| RadarSubscriber::attach(Arc::clone(&segment)).expect("no free slot"))
            .collect();

        group.bench_function(format!("round_trip_{subscribers}_subscribers"), |b| {
            b.iter(|| {
                publisher.send(black_box(object));
                for subscriber in &attached {
                    black_box(subscriber.take().map(|sample| sample.ts_ns));
                }
            });
        });
    }

    drop(group);
    drop(publisher);
    drop(segment);
    let _ = std::fs::remove_file(&path);
}

/// Loan and write in place, then publish.
fn bench_loan_publish(c: &mut Criterion) {
    let path = temp_shm_path("crit_loan");
    let segment = Arc::new(RadarSegment::create(&path).expect("failed to create segment"));
    let publisher = RadarPublisher::new(Arc::clone(&segment));
    let subscriber = RadarSubscriber::attach(Arc::clone(&segment)).expect("no free slot");

    let mut group = c.benchmark_group("chunk");
    group.throughput(Throughput::Elements(1));
    group.bench_function("loan_write_publish_take", |b| {
        b.iter(|| {
            if let Some(mut loan) = publisher.loan() {
                loan.ts_ns = black_box(1);
                loan.x_m = 2.0;
                loan.publish();
            }
            black_box(subscriber.take().map(|sample| sample.x_m));
        });
    });

    drop(group);
    drop(subscriber);
    drop(publisher);
    drop(segment);
    let _ = std::fs::remove_file(&path);
}

criterion_group!(benches, bench_send_no_subscriber, bench_round_trip, bench_loan_publish);
criterion_main!(benches);
