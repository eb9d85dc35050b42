use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Connection timeout for the initial NATS connect, in seconds
    #[serde(default = "default_nats_connect_timeout_secs")]
    pub nats_connect_timeout_secs: u64,

    // Sensor subjects
    #[serde(default = "default_audio_subject")]
    pub audio_subject: String,

    #[serde(default = "default_accelerometer_subject")]
    pub accelerometer_subject: String,

    #[serde(default = "default_camera_subject")]
    pub camera_subject: String,

    // Batching
    /// Batch size threshold for the audio topic (one reassembled clip)
    #[serde(default = "default_audio_batch_threshold")]
    pub audio_batch_threshold: usize,

    /// Batch size threshold for the accelerometer topic
    #[serde(default = "default_accelerometer_batch_threshold")]
    pub accelerometer_batch_threshold: usize,

    /// Batch size threshold for the camera topic
    #[serde(default = "default_camera_batch_threshold")]
    pub camera_batch_threshold: usize,

    /// Global timeout after which a non-empty batch window flushes
    /// regardless of size, in seconds
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,

    /// Period of the dispatch loop, in milliseconds
    #[serde(default = "default_dispatch_period_ms")]
    pub dispatch_period_ms: u64,

    // Execution pool
    /// Number of concurrent inference workers
    #[serde(default = "default_pool_workers")]
    pub pool_workers: usize,

    /// Watchdog timeout for a single inference task, in seconds
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    // Distributed mode
    /// Number of redundant worker replicas; above 1 activates the auction
    #[serde(default = "default_replica_quorum")]
    pub replica_quorum: usize,

    /// Stable worker identity; generated at startup when empty
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    #[serde(default = "default_announce_subject")]
    pub announce_subject: String,

    #[serde(default = "default_bid_subject")]
    pub bid_subject: String,

    /// How long an auction may wait for quorum before its job is dropped,
    /// in seconds
    #[serde(default = "default_auction_expiry_secs")]
    pub auction_expiry_secs: u64,

    // Default inference collaborator
    /// Distress probability at or above which an alert is raised
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_connect_timeout_secs() -> u64 {
    5
}

fn default_audio_subject() -> String {
    "sensor.audio".to_string()
}

fn default_accelerometer_subject() -> String {
    "sensor.accelerometer".to_string()
}

fn default_camera_subject() -> String {
    "sensor.camera".to_string()
}

fn default_audio_batch_threshold() -> usize {
    1
}

fn default_accelerometer_batch_threshold() -> usize {
    20
}

fn default_camera_batch_threshold() -> usize {
    1
}

fn default_batch_timeout_secs() -> u64 {
    500
}

fn default_dispatch_period_ms() -> u64 {
    1000
}

fn default_pool_workers() -> usize {
    3
}

fn default_task_timeout_secs() -> u64 {
    120
}

fn default_replica_quorum() -> usize {
    1
}

fn default_worker_id() -> String {
    String::new()
}

fn default_announce_subject() -> String {
    "jobs.announce".to_string()
}

fn default_bid_subject() -> String {
    "jobs.bids".to_string()
}

fn default_auction_expiry_secs() -> u64 {
    30
}

fn default_alert_threshold() -> f64 {
    0.9
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("HERDWATCH"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("HERDWATCH_LOG_LEVEL");
            std::env::remove_var("HERDWATCH_REPLICA_QUORUM");
        }

        let config = ServiceConfig::from_env().unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.audio_batch_threshold, 1);
        assert_eq!(config.accelerometer_batch_threshold, 20);
        assert_eq!(config.camera_batch_threshold, 1);
        assert_eq!(config.batch_timeout_secs, 500);
        assert_eq!(config.replica_quorum, 1);
        assert!(config.worker_id.is_empty());
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("HERDWATCH_LOG_LEVEL", "debug");
            std::env::set_var("HERDWATCH_REPLICA_QUORUM", "3");
        }

        let config = ServiceConfig::from_env().unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.replica_quorum, 3);

        // Clean up
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("HERDWATCH_LOG_LEVEL");
            std::env::remove_var("HERDWATCH_REPLICA_QUORUM");
        }
    }
}
