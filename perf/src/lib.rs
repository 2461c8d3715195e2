use iox_samples::{ObjectId, RadarObject};
use std::sync::OnceLock;
use std::time::Instant;

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Order statistics of a latency sample set, in the sample unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct BenchResult {
    pub name: String,
    pub unit: String,
    pub stats: Stats,
}

/// Sorts `samples` in place and reads the nearest-rank percentiles.
pub fn compute_stats(samples: &mut [u64]) -> Stats {
    assert!(!samples.is_empty(), "cannot compute stats on empty samples");
    samples.sort_unstable();
    let last = samples.len() - 1;
    let rank = |pct: f64| samples[((pct / 100.0 * samples.len() as f64).ceil() as usize).saturating_sub(1).min(last)];

    Stats {
        min: samples[0],
        p50: rank(50.0),
        p90: rank(90.0),
        p99: rank(99.0),
        p999: rank(99.9),
        max: samples[last],
        count: samples.len(),
    }
}

// ─── Measurement Harness ────────────────────────────────────────────────────

/// Runs `f` in `batches` timed batches of `batch_size` calls and reports the
/// per-call time of each batch.
pub fn measure_batched<F: FnMut()>(
    name: &str,
    batches: usize,
    batch_size: usize,
    warmup: usize,
    mut f: F,
) -> BenchResult {
    for _ in 0..warmup * batch_size {
        f();
    }

    let mut samples = Vec::with_capacity(batches);
    for _ in 0..batches {
        let start = Instant::now();
        for _ in 0..batch_size {
            f();
        }
        let total = start.elapsed().as_nanos();
        let per_op = ((total + (batch_size as u128 / 2)) / batch_size as u128) as u64;
        samples.push(per_op.max(1));
    }

    BenchResult {
        name: name.to_string(),
        unit: "ns/op".to_string(),
        stats: compute_stats(&mut samples),
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

pub fn temp_shm_path(label: &str) -> String {
    let pid = std::process::id();
    format!("/tmp/iox_bench_{label}_{pid}")
}

/// Monotonic nanoseconds since the first call in this process.
#[inline(always)]
pub fn mono_now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

pub fn make_test_object() -> RadarObject {
    RadarObject {
        ts_ns: mono_now_ns(),
        x_m: 42.5,
        y_m: -3.25,
        z_m: 0.75,
        velocity_mps: 13.9,
        object_id: ObjectId(7),
    }
}

const COLUMNS: [&str; 6] = ["min", "p50", "p90", "p99", "p99.9", "max"];

pub fn print_table_header() {
    print!("  {:<34}", "Benchmark");
    for column in COLUMNS {
        print!(" {column:>8}");
    }
    println!("  unit\n  {}", "─".repeat(96));
}

pub fn print_result_row(r: &BenchResult) {
    let Stats { min, p50, p90, p99, p999, max, .. } = r.stats;
    print!("  {:<34}", r.name);
    for value in [min, p50, p90, p99, p999, max] {
        print!(" {value:>8}");
    }
    println!("  {}", r.unit);
}

pub fn section_header(title: &str) {
    let rule = "─".repeat(90);
    println!("\n{rule}\n  {title}\n{rule}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_of_known_samples() {
        let mut samples: Vec<u64> = (1..=1000).rev().collect();
        let stats = compute_stats(&mut samples);
        assert_eq!(
            stats,
            Stats {
                min: 1,
                p50: 500,
                p90: 900,
                p99: 990,
                p999: 999,
                max: 1000,
                count: 1000,
            }
        );
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let stats = compute_stats(&mut [7]);
        assert_eq!((stats.min, stats.p50, stats.p999, stats.max), (7, 7, 7, 7));
    }
}
