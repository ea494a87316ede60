use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageBuffer, Rgb};

use crate::errors::{Result, StreamError};
use crate::snapshot::SnapshotSource;

const MAX_DIMENSION: u32 = 8192;

/// Generates a moving colour gradient instead of talking to a camera.
/// Useful on machines without a capture device.
pub struct TestPatternSource;

impl TestPatternSource {
    pub fn new() -> Self {
        Self
    }

    pub fn create_jpeg(&self, width: u32, height: u32) -> Result<Vec<u8>> {
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(StreamError::capture_failed(format!(
                "Test pattern size {}x{} exceeds {}x{}",
                width, height, MAX_DIMENSION, MAX_DIMENSION
            )));
        }

        // height 0 keeps a 4:3 aspect ratio
        let height = if height == 0 { (width / 4 * 3).max(1) } else { height };
        let width = width.max(1);

        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or(0);

        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let r = ((x + t / 10) % 255) as u8;
            let g = ((y + t / 20) % 255) as u8;
            let b = ((x + y + t / 5) % 255) as u8;
            Rgb([r, g, b])
        });

        let mut jpeg_data = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut jpeg_data), image::ImageFormat::Jpeg)
            .map_err(|e| StreamError::capture_failed(format!("Failed to encode test pattern: {}", e)))?;
        Ok(jpeg_data)
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotSource for TestPatternSource {
    async fn capture(&self, width: u32, height: u32) -> Result<Bytes> {
        Ok(Bytes::from(self.create_jpeg(width, height)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_is_a_decodable_jpeg_of_requested_size() {
        let jpeg = TestPatternSource::new().create_jpeg(64, 48).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let img = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));
    }

    #[test]
    fn test_zero_height_keeps_aspect_ratio() {
        let jpeg = TestPatternSource::new().create_jpeg(64, 0).unwrap();
        let img = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(img.height(), 48);
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let source = TestPatternSource::new();
        assert!(matches!(
            source.create_jpeg(2_000_000_000, 0),
            Err(StreamError::CaptureFailed { .. })
        ));
        assert!(source.create_jpeg(64, u32::MAX).is_err());
    }
}
