use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug)]
pub struct IoxConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Receive queue capacity requested by each subscriber.
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: u64,
    #[serde(default = "defaults::publish_interval_us")]
    pub publish_interval_us: u64,
    /// The subscriber follows every topic whose name starts with this.
    #[serde(default = "defaults::subscribe_prefix")]
    pub subscribe_prefix: String,
    #[serde(default = "defaults::topics")]
    pub topics: Vec<TopicConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TopicConfig {
    pub name: String,
    pub shm_file_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    use super::TopicConfig;

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn queue_capacity() -> u64 {
        16
    }

    pub fn publish_interval_us() -> u64 {
        1_000
    }

    pub fn subscribe_prefix() -> String {
        "radar/".into()
    }

    pub fn topics() -> Vec<TopicConfig> {
        vec![TopicConfig {
            name: "radar/front".into(),
            shm_file_path: "/tmp/iox_radar_front".into(),
        }]
    }
}

impl IoxConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let iox_config: IoxConfig = toml::from_str(&toml_to_str)?;
        Ok(iox_config)
    }

    /// Loads `path` if given, otherwise uses the defaults.
    pub fn load_or_default(path: Option<String>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

impl Default for IoxConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            queue_capacity: defaults::queue_capacity(),
            publish_interval_us: defaults::publish_interval_us(),
            subscribe_prefix: defaults::subscribe_prefix(),
            topics: defaults::topics(),
        }
    }
}
