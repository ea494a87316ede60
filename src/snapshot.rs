//! On-demand still images with a short-lived cache.
//!
//! Captures are keyed by the requested `(width, height)` and kept for the
//! configured time-to-live. Expiry is checked lazily on lookup. Misses are
//! serialized through a capture lock of their own, so a slow capture never
//! holds up session operations.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{SnapshotConfig, SnapshotSourceKind, StreamingConfig};
use crate::errors::{Result, StreamError};
use crate::test_pattern::TestPatternSource;

/// Something able to grab one JPEG frame.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn capture(&self, width: u32, height: u32) -> Result<Bytes>;
}

/// One-shot ffmpeg capture from the configured video device.
pub struct FfmpegSnapshotSource {
    ffmpeg_path: String,
    video_device: String,
    video_filename: String,
}

impl FfmpegSnapshotSource {
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            video_device: config.video_device.clone(),
            video_filename: config.video_filename.clone(),
        }
    }

    pub fn args(&self, width: u32) -> Vec<String> {
        // height -2 keeps the aspect ratio
        vec![
            "-hide_banner".to_string(),
            "-f".to_string(),
            self.video_device.clone(),
            "-framerate".to_string(),
            "30".to_string(),
            "-i".to_string(),
            self.video_filename.clone(),
            "-vf".to_string(),
            format!("scale={}:-2", width),
            "-frames:v".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "mjpeg".to_string(),
            "pipe:1".to_string(),
        ]
    }
}

#[async_trait]
impl SnapshotSource for FfmpegSnapshotSource {
    async fn capture(&self, width: u32, _height: u32) -> Result<Bytes> {
        // killed if the caller gives up on us
        let output = Command::new(&self.ffmpeg_path)
            .args(self.args(width))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StreamError::capture_failed(format!("Failed to run {}: {}", self.ffmpeg_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().last().unwrap_or("").trim();
            return Err(StreamError::capture_failed(format!(
                "{} exited with {}: {}",
                self.ffmpeg_path, output.status, last_line
            )));
        }

        Ok(Bytes::from(output.stdout))
    }
}

pub fn source_from_config(kind: &SnapshotSourceKind, streaming: &StreamingConfig) -> Arc<dyn SnapshotSource> {
    match kind {
        SnapshotSourceKind::Ffmpeg => Arc::new(FfmpegSnapshotSource::new(streaming)),
        SnapshotSourceKind::TestPattern => Arc::new(TestPatternSource::new()),
    }
}

/// A captured still image.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SnapshotKey {
    width: u32,
    height: u32,
}

struct CacheEntry {
    snapshot: Snapshot,
    created: Instant,
}

pub struct SnapshotCache {
    source: Arc<dyn SnapshotSource>,
    ttl: Duration,
    capture_timeout: Duration,
    entries: Mutex<HashMap<SnapshotKey, CacheEntry>>,
    capture_lock: Mutex<()>,
}

impl SnapshotCache {
    pub fn new(source: Arc<dyn SnapshotSource>, config: &SnapshotConfig) -> Self {
        Self {
            source,
            ttl: config.cache_ttl,
            capture_timeout: config.capture_timeout,
            entries: Mutex::new(HashMap::new()),
            capture_lock: Mutex::new(()),
        }
    }

    pub async fn snapshot(&self, width: u32, height: u32) -> Result<Snapshot> {
        let key = SnapshotKey { width, height };
        if let Some(snapshot) = self.lookup(key).await {
            debug!("Returning cached {}x{} snapshot", width, height);
            return Ok(snapshot);
        }

        let _capture = self.capture_lock.lock().await;
        // filled by whoever held the lock before us
        if let Some(snapshot) = self.lookup(key).await {
            return Ok(snapshot);
        }

        let jpeg = match tokio::time::timeout(self.capture_timeout, self.source.capture(width, height)).await {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                warn!("Snapshot capture {}x{} failed: {}", width, height, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Snapshot capture {}x{} timed out after {:?}", width, height, self.capture_timeout);
                return Err(StreamError::CaptureTimeout { timeout: self.capture_timeout });
            }
        };

        let decoded = image::load_from_memory(&jpeg)
            .map_err(|e| StreamError::capture_failed(format!("Captured image is not decodable: {}", e)))?;
        let snapshot = Snapshot {
            jpeg,
            width: decoded.width(),
            height: decoded.height(),
        };

        info!(
            "Captured {}x{} snapshot ({} bytes) for request {}x{}",
            snapshot.width,
            snapshot.height,
            snapshot.jpeg.len(),
            width,
            height
        );

        self.entries.lock().await.insert(
            key,
            CacheEntry {
                snapshot: snapshot.clone(),
                created: Instant::now(),
            },
        );
        Ok(snapshot)
    }

    /// Number of entries, expired ones included until they are looked up.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn lookup(&self, key: SnapshotKey) -> Option<Snapshot> {
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(entry) if entry.created.elapsed() < self.ttl => Some(entry.snapshot.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }
}
