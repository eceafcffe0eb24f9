use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::media::{DeviceError, VideoSource};

pub const FRAME_WIDTH: u32 = 320;
pub const JPEG_QUALITY: u8 = 60;

/// A downscaled JPEG snapshot of the video source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    jpeg: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    pub fn encode(image: &DynamicImage, target_width: u32, quality: u8) -> Result<Self, DeviceError> {
        let (width, height) = scaled_dimensions(image.width(), image.height(), target_width)
            .ok_or_else(|| {
                DeviceError::Unavailable(format!(
                    "cannot scale {}x{} frame to width {target_width}",
                    image.width(),
                    image.height()
                ))
            })?;
        let resized = image.resize_exact(width, height, FilterType::Triangle).to_rgb8();
        let mut jpeg = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
            encoder
                .encode_image(&resized)
                .map_err(|err| DeviceError::Encode(err.to_string()))?;
        }
        Ok(Self { jpeg, width, height })
    }

    /// Black frame used when a result is injected without a camera.
    pub fn blank(width: u32, height: u32) -> Result<Self, DeviceError> {
        let image = DynamicImage::ImageRgb8(RgbImage::new(width.max(1), height.max(1)));
        Self::encode(&image, width.max(1), JPEG_QUALITY)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.jpeg)
    }
}

/// Width is fixed; height keeps the native aspect ratio. `None` for an empty source or a height past `u32`.
pub fn scaled_dimensions(native_width: u32, native_height: u32, target_width: u32) -> Option<(u32, u32)> {
    if native_width == 0 || native_height == 0 || target_width == 0 {
        return None;
    }
    let height = (u64::from(native_height) * u64::from(target_width) / u64::from(native_width)).max(1);
    u32::try_from(height).ok().map(|height| (target_width, height))
}

/// Grabs the current frame off the async runtime and encodes it.
pub async fn capture_frame(
    video: Arc<dyn VideoSource>,
    target_width: u32,
    quality: u8,
) -> Result<Frame, DeviceError> {
    tokio::task::spawn_blocking(move || {
        let image = video.current_frame()?;
        Frame::encode(&image, target_width, quality)
    })
    .await
    .map_err(|err| DeviceError::Unavailable(format!("frame capture worker failed: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(DynamicImage);

    impl VideoSource for Fixed {
        fn current_frame(&self) -> Result<DynamicImage, DeviceError> {
            Ok(self.0.clone())
        }
        fn stop(&self) {}
    }

    struct Detached;

    impl VideoSource for Detached {
        fn current_frame(&self) -> Result<DynamicImage, DeviceError> {
            Err(DeviceError::Unavailable("no track".into()))
        }
        fn stop(&self) {}
    }

    #[test]
    fn scales_to_fixed_width_keeping_aspect() {
        assert_eq!(scaled_dimensions(1280, 720, 320), Some((320, 180)));
        assert_eq!(scaled_dimensions(640, 480, 320), Some((320, 240)));
        assert_eq!(scaled_dimensions(100, 75, 320), Some((320, 240)));
        assert_eq!(scaled_dimensions(1000, 1, 320), Some((320, 1)));
        assert_eq!(scaled_dimensions(0, 480, 320), None);
        assert_eq!(scaled_dimensions(1, u32::MAX, 320), None);
        assert_eq!(scaled_dimensions(2, u32::MAX, 2), Some((2, u32::MAX)));
    }

    #[test]
    fn encodes_jpeg() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(1280, 720));
        let frame = Frame::encode(&image, FRAME_WIDTH, JPEG_QUALITY).unwrap();
        assert_eq!((frame.width(), frame.height()), (320, 180));
        assert_eq!(&frame.bytes()[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(frame.bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 180));
        assert!(!frame.to_base64().is_empty());
    }

    #[tokio::test]
    async fn capture_uses_video_source() {
        let source = Arc::new(Fixed(DynamicImage::ImageRgb8(RgbImage::new(640, 480))));
        let frame = capture_frame(source, FRAME_WIDTH, JPEG_QUALITY).await.unwrap();
        assert_eq!(frame.height(), 240);
    }

    #[tokio::test]
    async fn capture_without_video_is_device_unavailable() {
        let err = capture_frame(Arc::new(Detached), FRAME_WIDTH, JPEG_QUALITY)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
    }
}
