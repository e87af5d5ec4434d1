use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GazecapConfig {
    pub capture: CaptureConfig,
    pub tracking: TrackingConfig,
    pub buffer: BufferConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// Target capture frame rate
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Duration of each recorded video chunk in milliseconds
    #[serde(default = "default_chunk_duration_ms")]
    pub chunk_duration_ms: u64,

    /// Capture quality tier (low, balanced, high)
    #[serde(default = "default_quality")]
    pub quality: String,

    /// Preferred codec (e.g. "vp9"); negotiation falls back through the
    /// priority list when the device does not support it
    pub preferred_codec: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrackingConfig {
    pub socket: SocketConfig,
    pub simulation: SimulationConfig,

    /// Sampling rate assumed for loss estimation before enough samples
    /// have arrived to measure the real rate
    #[serde(default = "default_sampling_rate_hz")]
    pub default_sampling_rate_hz: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SocketConfig {
    /// Tracker feed host
    #[serde(default = "default_socket_host")]
    pub host: String,

    /// Tracker feed port
    #[serde(default = "default_socket_port")]
    pub port: u16,

    /// Reconnect automatically after a dropped connection
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,

    /// Initial reconnect delay; doubles per attempt
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for the reconnect delay
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SimulationConfig {
    /// Peak jitter applied to simulated gaze positions, in pixels
    #[serde(default = "default_jitter_px")]
    pub jitter_px: f64,

    /// Seconds between simulated loss-of-signal periods
    #[serde(default = "default_blink_interval_secs")]
    pub blink_interval_secs: u64,

    /// Length of each simulated loss-of-signal period in milliseconds
    #[serde(default = "default_blink_duration_ms")]
    pub blink_duration_ms: u64,

    /// Confidence reported for simulated samples
    #[serde(default = "default_sim_confidence")]
    pub confidence: f64,

    /// Smooth simulated positions with the one-euro filter before ingestion
    #[serde(default)]
    pub smoothing: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BufferConfig {
    /// Flush the sample buffer once it holds this many samples
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Flush the sample buffer at least this often
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(default = "default_storage_path")]
    pub path: String,

    /// Storage budget used for quota reporting and cleanup triggering
    #[serde(default = "default_quota_budget_bytes")]
    pub quota_budget_bytes: u64,

    pub cleanup: CleanupConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CleanupConfig {
    /// Enable chunk pruning
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,

    /// First-pass cutoff: prune chunk payloads older than this many hours
    #[serde(default = "default_max_chunk_age_hours")]
    pub max_chunk_age_hours: u32,

    /// Escalated cutoff used when usage stays above the trigger threshold
    #[serde(default = "default_aggressive_age_hours")]
    pub aggressive_age_hours: u32,

    /// Quota usage ratio above which the second pass runs
    #[serde(default = "default_usage_trigger")]
    pub usage_trigger: f64,
}

fn default_frame_rate() -> u32 {
    30
}

fn default_chunk_duration_ms() -> u64 {
    1000
}

fn default_quality() -> String {
    "balanced".to_string()
}

fn default_sampling_rate_hz() -> f64 {
    60.0
}

fn default_socket_host() -> String {
    "127.0.0.1".to_string()
}

fn default_socket_port() -> u16 {
    8765
}

fn default_reconnect() -> bool {
    true
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    15_000
}

fn default_jitter_px() -> f64 {
    12.0
}

fn default_blink_interval_secs() -> u64 {
    4
}

fn default_blink_duration_ms() -> u64 {
    150
}

fn default_sim_confidence() -> f64 {
    0.85
}

fn default_max_batch() -> usize {
    50
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_storage_path() -> String {
    "./gazecap.db".to_string()
}

fn default_quota_budget_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_max_chunk_age_hours() -> u32 {
    24
}

fn default_aggressive_age_hours() -> u32 {
    6
}

fn default_usage_trigger() -> f64 {
    0.8
}

impl GazecapConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("gazecap.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("capture.frame_rate", default_frame_rate())?
            .set_default("capture.chunk_duration_ms", default_chunk_duration_ms() as i64)?
            .set_default("capture.quality", default_quality())?
            .set_default("tracking.socket.host", default_socket_host())?
            .set_default("tracking.socket.port", default_socket_port() as i64)?
            .set_default("tracking.socket.reconnect", default_reconnect())?
            .set_default(
                "tracking.socket.reconnect_base_delay_ms",
                default_reconnect_base_delay_ms() as i64,
            )?
            .set_default(
                "tracking.socket.reconnect_max_delay_ms",
                default_reconnect_max_delay_ms() as i64,
            )?
            .set_default("tracking.simulation.jitter_px", default_jitter_px())?
            .set_default(
                "tracking.simulation.blink_interval_secs",
                default_blink_interval_secs() as i64,
            )?
            .set_default(
                "tracking.simulation.blink_duration_ms",
                default_blink_duration_ms() as i64,
            )?
            .set_default("tracking.simulation.confidence", default_sim_confidence())?
            .set_default("tracking.simulation.smoothing", false)?
            .set_default(
                "tracking.default_sampling_rate_hz",
                default_sampling_rate_hz(),
            )?
            .set_default("buffer.max_batch", default_max_batch() as i64)?
            .set_default("buffer.flush_interval_ms", default_flush_interval_ms() as i64)?
            .set_default("storage.path", default_storage_path())?
            .set_default(
                "storage.quota_budget_bytes",
                default_quota_budget_bytes() as i64,
            )?
            .set_default("storage.cleanup.enabled", default_cleanup_enabled())?
            .set_default(
                "storage.cleanup.max_chunk_age_hours",
                default_max_chunk_age_hours() as i64,
            )?
            .set_default(
                "storage.cleanup.aggressive_age_hours",
                default_aggressive_age_hours() as i64,
            )?
            .set_default("storage.cleanup.usage_trigger", default_usage_trigger())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("GAZECAP").separator("__"))
            .build()?;

        let config: GazecapConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.frame_rate == 0 {
            return Err(ConfigError::Message(
                "Capture frame_rate must be greater than 0".to_string(),
            ));
        }

        if self.capture.chunk_duration_ms == 0 {
            return Err(ConfigError::Message(
                "Capture chunk_duration_ms must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.capture.quality.as_str(), "low" | "balanced" | "high") {
            return Err(ConfigError::Message(format!(
                "Unknown capture quality '{}': expected low, balanced, or high",
                self.capture.quality
            )));
        }

        if self.tracking.default_sampling_rate_hz <= 0.0 {
            return Err(ConfigError::Message(
                "Tracking default_sampling_rate_hz must be positive".to_string(),
            ));
        }

        if self.buffer.max_batch == 0 {
            return Err(ConfigError::Message(
                "Buffer max_batch must be greater than 0".to_string(),
            ));
        }

        if self.buffer.flush_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Buffer flush_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.storage.path.is_empty() {
            return Err(ConfigError::Message(
                "Storage path must not be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.storage.cleanup.usage_trigger) {
            return Err(ConfigError::Message(
                "Cleanup usage_trigger must be within [0, 1]".to_string(),
            ));
        }

        if self.storage.cleanup.aggressive_age_hours > self.storage.cleanup.max_chunk_age_hours {
            return Err(ConfigError::Message(
                "Cleanup aggressive_age_hours must not exceed max_chunk_age_hours".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for GazecapConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                frame_rate: default_frame_rate(),
                chunk_duration_ms: default_chunk_duration_ms(),
                quality: default_quality(),
                preferred_codec: None,
            },
            tracking: TrackingConfig {
                socket: SocketConfig {
                    host: default_socket_host(),
                    port: default_socket_port(),
                    reconnect: default_reconnect(),
                    reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
                    reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
                },
                simulation: SimulationConfig {
                    jitter_px: default_jitter_px(),
                    blink_interval_secs: default_blink_interval_secs(),
                    blink_duration_ms: default_blink_duration_ms(),
                    confidence: default_sim_confidence(),
                    smoothing: false,
                },
                default_sampling_rate_hz: default_sampling_rate_hz(),
            },
            buffer: BufferConfig {
                max_batch: default_max_batch(),
                flush_interval_ms: default_flush_interval_ms(),
            },
            storage: StorageConfig {
                path: default_storage_path(),
                quota_budget_bytes: default_quota_budget_bytes(),
                cleanup: CleanupConfig {
                    enabled: default_cleanup_enabled(),
                    max_chunk_age_hours: default_max_chunk_age_hours(),
                    aggressive_age_hours: default_aggressive_age_hours(),
                    usage_trigger: default_usage_trigger(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = GazecapConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_frame_rate() {
        let mut config = GazecapConfig::default();
        config.capture.frame_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_quality() {
        let mut config = GazecapConfig::default();
        config.capture.quality = "maximum".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_cleanup_cutoffs() {
        let mut config = GazecapConfig::default();
        config.storage.cleanup.aggressive_age_hours = 48;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_defaults_without_file() {
        let config = GazecapConfig::load_from_file("/nonexistent/gazecap.toml").unwrap();
        assert_eq!(config.capture.frame_rate, 30);
        assert_eq!(config.tracking.socket.port, 8765);
        assert_eq!(config.buffer.max_batch, 50);
    }
}
