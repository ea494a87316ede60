use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::ops::Range;
use std::time::Duration;
use tracing::info;

use crate::errors::{Result, StreamError};

/// Target platform of the capture pipeline. Device names, the audio playback
/// tool and a handful of ffmpeg flags differ between the two.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Platform {
    #[serde(rename = "linux")]
    Linux,
    #[serde(rename = "macos")]
    MacOs,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::MacOs => write!(f, "macos"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotSourceKind {
    #[serde(rename = "ffmpeg")]
    Ffmpeg,
    #[serde(rename = "test-pattern")]
    TestPattern,
}

impl Default for SnapshotSourceKind {
    fn default() -> Self {
        Self::Ffmpeg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub platform: Platform,
    pub ffmpeg_path: String,
    pub ffplay_path: String,      // macOS audio playback tool
    pub video_device: String,     // -f for the video input (e.g. "v4l2", "avfoundation")
    pub video_filename: String,   // -i for the video input (e.g. "/dev/video0")
    pub audio_device: String,     // -f for audio capture and playback (e.g. "alsa")
    pub audio_input: String,
    pub audio_output: String,
    pub h264_decoder: Option<String>,
    pub h264_encoder: String,
    pub min_video_bitrate: u32,   // kbps
    pub verbose: bool,            // Surface ffmpeg stdout/stderr instead of discarding it
    #[serde(with = "humantime_duration")]
    pub stop_grace_period: Duration,
}

impl StreamingConfig {
    pub fn for_platform(platform: Platform) -> Self {
        let (video_device, video_filename, audio_device, h264_encoder) = match platform {
            Platform::Linux => ("v4l2", "/dev/video0", "alsa", "h264_omx"),
            Platform::MacOs => ("avfoundation", "default", "avfoundation", "libx264"),
        };

        Self {
            platform,
            ffmpeg_path: "ffmpeg".to_string(),
            ffplay_path: "ffplay".to_string(),
            video_device: video_device.to_string(),
            video_filename: video_filename.to_string(),
            audio_device: audio_device.to_string(),
            audio_input: "default".to_string(),
            audio_output: "default".to_string(),
            h264_decoder: None,
            h264_encoder: h264_encoder.to_string(),
            min_video_bitrate: 0,
            verbose: false,
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self::for_platform(Platform::current())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port1_range: Range<u16>,
    pub port2_range: Range<u16>,
    pub buffer_size: usize,
    /// Overrides the unspecified address of the controller's IP family.
    pub bind_address: Option<IpAddr>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port1_range: 3000..4000,
            port2_range: 4000..5000,
            buffer_size: 2048,
            bind_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub source: SnapshotSourceKind,
    #[serde(with = "humantime_duration")]
    pub cache_ttl: Duration,
    #[serde(with = "humantime_duration")]
    pub capture_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            source: SnapshotSourceKind::Ffmpeg,
            cache_ttl: Duration::from_secs(10),
            capture_timeout: Duration::from_secs(3),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.validate()?;
        info!("Loaded configuration from '{}' (platform: {})", path, config.streaming.platform);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let relay = &self.relay;
        if relay.port1_range.is_empty() || relay.port2_range.is_empty() {
            return Err(StreamError::config("Relay port ranges must not be empty"));
        }
        if relay.port1_range.start < relay.port2_range.end && relay.port2_range.start < relay.port1_range.end {
            return Err(StreamError::config(format!(
                "Relay port ranges {:?} and {:?} overlap",
                relay.port1_range, relay.port2_range
            )));
        }
        if relay.buffer_size == 0 {
            return Err(StreamError::config("Relay buffer size must be positive"));
        }
        if self.snapshot.capture_timeout.is_zero() {
            return Err(StreamError::config("Snapshot capture timeout must be positive"));
        }
        Ok(())
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
