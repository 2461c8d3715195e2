use anyhow::Context;
use iox_chunk::TopicRegistry;
use iox_config::IoxConfig;
use iox_samples::{ObjectId, RadarObject, RadarPublisher, RadarSegment};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|t| t.as_nanos() as u64)
        .unwrap_or_default()
}

fn main() -> anyhow::Result<()> {
    let config = IoxConfig::load_or_default(std::env::args().nth(1)).context("loading config")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut registry = TopicRegistry::new();
    let mut publishers = Vec::with_capacity(config.topics.len());
    for topic in &config.topics {
        let id = registry
            .register(&topic.name)
            .with_context(|| format!("cannot register topic '{}'", topic.name))?;
        let segment = RadarSegment::open_or_create(&topic.shm_file_path)
            .with_context(|| format!("creating segment for '{}'", topic.name))?;
        tracing::info!(topic = %topic.name, id = %id, path = %topic.shm_file_path, "publishing");
        publishers.push(RadarPublisher::new(Arc::new(segment)));
    }

    let interval = Duration::from_micros(config.publish_interval_us);
    let mut last = Instant::now();
    let mut sent: u64 = 0;
    let mut dropped: u64 = 0;
    let mut step: u32 = 0;

    loop {
        step = step.wrapping_add(1);
        let phase = f64::from(step % 1_000) / 1_000.0;

        for (i, publisher) in publishers.iter().enumerate() {
            let object = RadarObject {
                ts_ns: now_ns(),
                x_m: 50.0 * phase,
                y_m: i as f64,
                z_m: 0.5,
                velocity_mps: 12.5,
                object_id: ObjectId(step),
            };
            match publisher.send(object) {
                Some(_) => sent += 1,
                None => dropped += 1,
            }
        }

        if last.elapsed() >= Duration::from_secs(1) {
            tracing::info!(sent, dropped, "publish rate per second");
            sent = 0;
            dropped = 0;
            last = Instant::now();
        }

        if interval.is_zero() {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(interval);
        }
    }
}
