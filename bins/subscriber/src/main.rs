use anyhow::{Context, bail};
use iox_chunk::{TopicId, TopicRegistry};
use iox_config::{IoxConfig, TopicConfig};
use iox_samples::{RadarSegment, RadarSubscriber};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// How long to wait for a publisher to create a segment.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

fn open_segment(topic: &TopicConfig) -> anyhow::Result<RadarSegment> {
    let deadline = Instant::now() + OPEN_TIMEOUT;
    loop {
        match RadarSegment::open(&topic.shm_file_path) {
            Ok(segment) => return Ok(segment),
            Err(e) if Instant::now() < deadline => {
                tracing::debug!(topic = %topic.name, error = %e, "segment not ready, retrying");
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("opening segment for '{}'", topic.name));
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = IoxConfig::load_or_default(std::env::args().nth(1)).context("loading config")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut registry = TopicRegistry::new();
    let mut topics: HashMap<TopicId, &TopicConfig> = HashMap::new();
    for topic in &config.topics {
        let id = registry
            .register(&topic.name)
            .with_context(|| format!("cannot register topic '{}'", topic.name))?;
        topics.insert(id, topic);
    }

    let matching = registry.lookup_prefix(&config.subscribe_prefix);
    if matching.is_empty() {
        bail!("no configured topic starts with '{}'", config.subscribe_prefix);
    }

    let mut subscribers = Vec::with_capacity(matching.len());
    for id in matching {
        let Some(&topic) = topics.get(&id) else {
            continue;
        };
        let segment = Arc::new(open_segment(topic)?);
        let subscriber = RadarSubscriber::attach(segment)
            .with_context(|| format!("attaching to '{}'", topic.name))?;
        if !subscriber.set_queue_capacity(config.queue_capacity) {
            tracing::warn!(
                topic = %topic.name,
                requested = config.queue_capacity,
                kept = subscriber.queue_capacity(),
                "queue capacity rejected"
            );
        }
        tracing::info!(topic = %topic.name, id = %id, slot = subscriber.slot_id(), "subscribed");
        subscribers.push((topic.name.as_str(), subscriber));
    }

    let mut last = Instant::now();
    let mut received: u64 = 0;
    let mut gaps: HashMap<&str, u64> = HashMap::new();
    let mut next_sequence: HashMap<&str, u64> = HashMap::new();

    loop {
        let mut idle = true;
        for &(name, ref subscriber) in &subscribers {
            while let Some(sample) = subscriber.take() {
                idle = false;
                received += 1;

                // sequence numbers are per segment; a jump means queue overflow
                let sequence = sample.sequence();
                if let Some(&expected) = next_sequence.get(name)
                    && sequence > expected
                {
                    *gaps.entry(name).or_default() += sequence - expected;
                }
                next_sequence.insert(name, sequence + 1);

                tracing::trace!(
                    topic = %name,
                    sequence,
                    object = sample.object_id.0,
                    range_m = sample.range_m(),
                    "sample"
                );
            }
        }

        if last.elapsed() >= Duration::from_secs(1) {
            let lost: u64 = gaps.values().sum();
            tracing::info!(received, lost, "receive rate per second");
            received = 0;
            gaps.clear();
            last = Instant::now();
        }

        if idle {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}
