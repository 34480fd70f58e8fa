use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queueing and backpressure
    pub pipe: PipeConfig,

    /// A/V drift correction
    pub sync: SyncConfig,

    /// Relative seek steps
    pub seek: SeekConfig,

    /// Audio output
    pub audio: AudioConfig,

    pub logging: LoggingConfig,
}

impl Config {
    /// Load a TOML file, filling missing fields with defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// How much payload a pipe may hold before the producer blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    None,
    #[default]
    Shallow,
    Deep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Default buffering policy when a backend does not choose one
    pub buffer_mode: BufferMode,

    /// Byte ceiling for shallow buffering
    pub shallow_bytes: usize,

    /// Byte ceiling for deep buffering
    pub deep_bytes: usize,

    /// Packet ceiling across all queues
    pub max_packets: usize,

    /// An active queue below this many packets always accepts more
    pub min_packets: usize,

    /// Queued duration that also counts as full (ms)
    pub max_realtime_delay_ms: Option<u64>,

    /// Queued duration required before a pre-buffering pipe starts (ms)
    pub pre_buffer_ms: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            buffer_mode: BufferMode::Shallow,
            shallow_bytes: 1024 * 1024,
            deep_bytes: 32 * 1024 * 1024,
            max_packets: 200,
            min_packets: 5,
            max_realtime_delay_ms: None,
            pre_buffer_ms: 2000,
        }
    }
}

impl PipeConfig {
    pub fn byte_limit(&self, mode: BufferMode) -> usize {
        match mode {
            BufferMode::None => 0,
            BufferMode::Shallow => self.shallow_bytes,
            BufferMode::Deep => self.deep_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub kalman_q: f64,
    pub kalman_r: f64,

    /// Drift at or beyond this is a discontinuity, not drift (us)
    pub outlier_threshold_us: i64,

    /// Bound on the smoothed offset (seconds)
    pub clamp: f64,

    /// Largest per-frame correction (us)
    pub max_correction_us: i64,

    /// Display latency, in frames
    pub latency_frames: i64,

    /// Smoothed offset beyond which frames are held or dropped (seconds)
    pub status_threshold: f64,

    /// Frame duration used before one can be estimated (us)
    pub default_frame_duration: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            kalman_q: 1.0 / 100_000.0,
            kalman_r: 0.01,
            outlier_threshold_us: 10_000_000,
            clamp: 10.0,
            max_correction_us: 5000,
            latency_frames: 2,
            status_threshold: 0.1,
            default_frame_duration: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekConfig {
    pub step_ms: i64,
    pub fast_step_ms: i64,

    /// Going back past this position restarts the track instead
    pub skip_limit_ms: i64,
}

impl Default for SeekConfig {
    fn default() -> Self {
        Self {
            step_ms: 15_000,
            fast_step_ms: 60_000,
            skip_limit_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,

    /// Output sample rate (Hz)
    pub sample_rate: u32,

    /// Output channels
    pub channels: u16,

    /// Device-side buffer (ms)
    pub jitter_buffer_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 44100,
            channels: 2,
            jitter_buffer_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is not set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}
