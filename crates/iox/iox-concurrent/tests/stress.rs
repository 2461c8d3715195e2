//! Multi-threaded stress tests for the lock-free queues.
//!
//! Every test accounts for each item individually: nothing may be lost,
//! duplicated or invented, whatever the interleaving.
//!
//! ```bash
//! cargo test -p iox-concurrent --test stress --release
//! ```

use iox_concurrent::{IndexQueue, InitialState, ResizeableLockFreeQueue};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

const THREADS: usize = 4;
const ROUNDS: usize = 20_000;

/// Threads repeatedly pop an index and push it back. At the end the queue
/// must contain every index exactly once.
#[test]
fn index_queue_preserves_every_index() {
    const CAP: usize = 32;
    let queue = Arc::new(IndexQueue::<CAP>::new(InitialState::Full));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    if let Some(index) = queue.pop() {
                        assert!(index < CAP as u64);
                        assert!(queue.push(index));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut seen: Vec<u64> = std::iter::from_fn(|| queue.pop()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..CAP as u64).collect::<Vec<_>>());
}

/// Values from several producers reach the consumers exactly once, and each
/// producer's values arrive in the order they were pushed.
#[test]
fn resizeable_queue_mpmc_delivers_each_value_once() {
    const PER_PRODUCER: u64 = 10_000;
    let queue = Arc::new(ResizeableLockFreeQueue::<u64, 64>::with_capacity(16));
    let received = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..THREADS as u64)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let mut value = (p << 32) | seq;
                    while let Err(back) = queue.try_push(value) {
                        value = back;
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let received = Arc::clone(&received);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut local = Vec::new();
                loop {
                    match queue.pop() {
                        Some(v) => local.push(v),
                        None if done.load(Ordering::Acquire) && queue.is_empty() => break,
                        None => thread::yield_now(),
                    }
                }
                received.lock().unwrap().push(local);
            })
        })
        .collect();

    for h in producers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in consumers {
        h.join().unwrap();
    }

    let per_consumer = received.lock().unwrap();
    for local in per_consumer.iter() {
        let mut last = [None::<u64>; THREADS];
        for v in local {
            let producer = (v >> 32) as usize;
            let seq = v & 0xffff_ffff;
            if let Some(prev) = last[producer] {
                assert!(seq > prev, "producer {producer} reordered: {prev} then {seq}");
            }
            last[producer] = Some(seq);
        }
    }

    let mut all: Vec<u64> = per_consumer.iter().flatten().copied().collect();
    all.sort_unstable();
    let expected: Vec<u64> = (0..THREADS as u64)
        .flat_map(|p| (0..PER_PRODUCER).map(move |s| (p << 32) | s))
        .collect();
    assert_eq!(all, expected);
}

/// Overflowing pushes, pops and capacity changes race each other. Every value
/// must leave the queue exactly once: popped, evicted by push, removed by the
/// resize handler, or drained at the end.
#[test]
fn resizeable_queue_accounts_for_values_under_resizing() {
    const MAX: usize = 32;
    const PER_PRODUCER: u64 = 20_000;
    let queue = Arc::new(ResizeableLockFreeQueue::<u64, MAX>::new());
    let stop = Arc::new(AtomicBool::new(false));
    let left = Arc::new(AtomicU64::new(0));

    let producers: Vec<_> = (0..2u64)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let left = Arc::clone(&left);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    if queue.push((p << 32) | seq).is_some() {
                        left.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    let consumer = {
        let queue = Arc::clone(&queue);
        let left = Arc::clone(&left);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                if queue.pop().is_some() {
                    left.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };

    let resizer = {
        let queue = Arc::clone(&queue);
        let left = Arc::clone(&left);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut capacity = 1u64;
            while !stop.load(Ordering::Acquire) {
                capacity = capacity % MAX as u64 + 1;
                let ok = queue.set_capacity(capacity, |_| {
                    left.fetch_add(1, Ordering::Relaxed);
                });
                assert!(ok);
                assert_eq!(queue.capacity(), capacity);
            }
        })
    };

    for h in producers {
        h.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    consumer.join().unwrap();
    resizer.join().unwrap();

    while queue.pop().is_some() {
        left.fetch_add(1, Ordering::Relaxed);
    }
    assert_eq!(left.load(Ordering::Relaxed), 2 * PER_PRODUCER);

    // all slots are back in circulation after a final grow
    assert!(queue.set_capacity_discarding(MAX as u64));
    for v in 0..MAX as u64 {
        assert!(queue.try_push(v).is_ok());
    }
    assert!(queue.try_push(0).is_err());
}
