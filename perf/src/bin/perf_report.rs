use std::hint::black_box;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use iox_chunk::{ChunkHeader, SegmentHeader, bytes_for_segment};
use iox_concurrent::{IndexQueue, InitialState, ResizeableLockFreeQueue};
use iox_perf::*;
use iox_samples::{RadarObject, RadarPublisher, RadarSegment, RadarSubscriber};

const HANDOFF_SAMPLES: usize = 200_000;

fn main() {
    let mut results: Vec<BenchResult> = Vec::new();

    // ═══════════════════════════════════════════════════════════════════════
    // 1. Memory Layout
    // ═══════════════════════════════════════════════════════════════════════
    section_memory_layout();

    // ═══════════════════════════════════════════════════════════════════════
    // 2. Single-Thread Primitives
    // ═══════════════════════════════════════════════════════════════════════
    section_primitives(&mut results);

    // ═══════════════════════════════════════════════════════════════════════
    // 3. Cross-Thread Handoff (publish -> take)
    // ═══════════════════════════════════════════════════════════════════════
    section_handoff(&mut results);

    section_header("Summary");
    print_table_header();
    for r in &results {
        print_result_row(r);
    }
    println!();
}

fn section_memory_layout() {
    section_header("Memory Layout");
    println!("  {:<36} {:>8} {:>6}", "type", "size", "align");
    let rows = [
        ("SegmentHeader", size_of::<SegmentHeader>(), align_of::<SegmentHeader>()),
        ("ChunkHeader", size_of::<ChunkHeader>(), align_of::<ChunkHeader>()),
        ("RadarObject", size_of::<RadarObject>(), align_of::<RadarObject>()),
        ("IndexQueue<64>", size_of::<IndexQueue<64>>(), align_of::<IndexQueue<64>>()),
        (
            "ResizeableLockFreeQueue<u32, 64>",
            size_of::<ResizeableLockFreeQueue<u32, 64>>(),
            align_of::<ResizeableLockFreeQueue<u32, 64>>(),
        ),
    ];
    for (name, size, align) in rows {
        println!("  {name:<36} {size:>8} {align:>6}");
    }
    println!(
        "\n  RadarSegment file size: {} bytes",
        bytes_for_segment::<RadarObject, 256, 4, 64>()
    );
}

fn section_primitives(results: &mut Vec<BenchResult>) {
    section_header("Single-Thread Primitives");
    print_table_header();

    let queue = IndexQueue::<1024>::new(InitialState::Full);
    let r = measure_batched("index_queue pop_push", 2_000, 1_000, 10, || {
        if let Some(index) = queue.pop() {
            queue.push(black_box(index));
        }
    });
    print_result_row(&r);
    results.push(r);

    let resizeable = ResizeableLockFreeQueue::<u64, 64>::new();
    let r = measure_batched("resizeable push_pop", 2_000, 1_000, 10, || {
        resizeable.push(black_box(1));
        black_box(resizeable.pop());
    });
    print_result_row(&r);
    results.push(r);

    let path = temp_shm_path("report_rt");
    match RadarSegment::create(&path) {
        Ok(segment) => {
            let segment = Arc::new(segment);
            let publisher = RadarPublisher::new(Arc::clone(&segment));
            let subscriber = RadarSubscriber::attach(Arc::clone(&segment));
            if let Ok(subscriber) = subscriber {
                let object = make_test_object();
                let r = measure_batched("chunk send_take (same thread)", 2_000, 1_000, 10, || {
                    publisher.send(black_box(object));
                    black_box(subscriber.take().map(|s| s.ts_ns));
                });
                print_result_row(&r);
                results.push(r);
            }
        }
        Err(e) => println!("  skipped chunk round trip: {e}"),
    }
    let _ = std::fs::remove_file(&path);
}

/// Publisher and subscriber on two threads, each mapping the segment on its
/// own. Latency is measured from the timestamp written into the chunk to the
/// moment the subscriber reads it.
fn section_handoff(results: &mut Vec<BenchResult>) {
    section_header("Cross-Thread Handoff");

    let path = temp_shm_path("report_handoff");
    let segment = match RadarSegment::create(&path) {
        Ok(segment) => Arc::new(segment),
        Err(e) => {
            println!("  skipped: {e}");
            return;
        }
    };
    let subscriber_segment = match RadarSegment::open(&path) {
        Ok(segment) => Arc::new(segment),
        Err(e) => {
            println!("  skipped: {e}");
            return;
        }
    };

    let ready = Arc::new(Barrier::new(2));
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let ready = Arc::clone(&ready);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut latencies = Vec::with_capacity(HANDOFF_SAMPLES);
            let Ok(subscriber) = RadarSubscriber::attach(subscriber_segment) else {
                ready.wait();
                return latencies;
            };
            ready.wait();
            loop {
                match subscriber.take() {
                    Some(sample) => {
                        latencies.push(mono_now_ns().saturating_sub(sample.ts_ns));
                    }
                    None if done.load(Ordering::Acquire) => {
                        while let Some(sample) = subscriber.take() {
                            latencies.push(mono_now_ns().saturating_sub(sample.ts_ns));
                        }
                        break;
                    }
                    None => std::hint::spin_loop(),
                }
            }
            latencies
        })
    };

    ready.wait();
    let publisher = RadarPublisher::new(Arc::clone(&segment));
    let mut pool_empty = 0u64;
    for _ in 0..HANDOFF_SAMPLES {
        let mut object = make_test_object();
        loop {
            object.ts_ns = mono_now_ns();
            if publisher.send(object).is_some() {
                break;
            }
            pool_empty += 1;
            std::hint::spin_loop();
        }
        // leave the consumer a chance to keep up
        for _ in 0..64 {
            std::hint::spin_loop();
        }
    }
    done.store(true, Ordering::Release);

    let mut latencies = consumer.join().unwrap_or_default();
    let _ = std::fs::remove_file(&path);

    println!("  published: {HANDOFF_SAMPLES}, received: {}", latencies.len());
    println!("  lost to queue overflow: {}", HANDOFF_SAMPLES.saturating_sub(latencies.len()));
    println!("  publisher waited for a free chunk: {pool_empty} times");
    if latencies.is_empty() {
        return;
    }

    let r = BenchResult {
        name: "publish -> take latency".to_string(),
        unit: "ns".to_string(),
        stats: compute_stats(&mut latencies),
    };
    println!();
    print_table_header();
    print_result_row(&r);
    results.push(r);
}
