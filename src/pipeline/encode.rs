// SPDX-License-Identifier: GPL-3.0-only

//! Frame encoding: optional rotation followed by JPEG compression

use super::{RawFrame, Rotation};
use crate::constants::{DEFAULT_QUALITY, MAX_QUALITY, MIN_QUALITY};
use crate::errors::EncodeError;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops;

/// Parameters applied to every frame until the next reconfiguration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Rotate frames by their sensor rotation before encoding
    pub rotate: bool,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            rotate: false,
        }
    }
}

/// Turns one raw frame into one compressed image
///
/// Called on the blocking pool, one frame at a time.
pub trait FrameEncoder: Send + Sync + 'static {
    fn encode(&self, frame: &RawFrame, params: &EncodeParams) -> Result<Vec<u8>, EncodeError>;
}

/// RGBA to JPEG encoder backed by the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegFrameEncoder;

impl JpegFrameEncoder {
    fn to_rgb(frame: &RawFrame) -> Result<RgbImage, EncodeError> {
        let expected = frame.width as usize * frame.height as usize * 4;
        if frame.width == 0 || frame.height == 0 || frame.data.len() != expected {
            return Err(EncodeError::InvalidFrame(format!(
                "{}x{} RGBA needs {} bytes, got {}",
                frame.width,
                frame.height,
                expected,
                frame.data.len()
            )));
        }

        // Drop alpha; JPEG has no transparency
        let rgb: Vec<u8> = frame
            .data
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();

        RgbImage::from_raw(frame.width, frame.height, rgb)
            .ok_or_else(|| EncodeError::InvalidFrame("buffer size mismatch".into()))
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&self, frame: &RawFrame, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
        let image = Self::to_rgb(frame)?;

        let image = match (params.rotate, frame.rotation) {
            (true, Rotation::Rotate90) => imageops::rotate90(&image),
            (true, Rotation::Rotate180) => imageops::rotate180(&image),
            (true, Rotation::Rotate270) => imageops::rotate270(&image),
            _ => image,
        };

        let quality = params.quality.clamp(MIN_QUALITY, MAX_QUALITY);
        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        encoder
            .encode(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| EncodeError::Codec(format!("JPEG encoding failed: {}", e)))?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, rotation: Rotation) -> RawFrame {
        RawFrame::new(width, height, vec![200; (width * height * 4) as usize], rotation)
    }

    fn decoded_dimensions(jpeg: &[u8]) -> (u32, u32) {
        let image = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg).unwrap();
        (image.width(), image.height())
    }

    #[test]
    fn test_encodes_jpeg() {
        let data = JpegFrameEncoder
            .encode(&frame(8, 4, Rotation::None), &EncodeParams::default())
            .unwrap();

        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        assert_eq!(decoded_dimensions(&data), (8, 4));
    }

    #[test]
    fn test_rotation_only_when_enabled() {
        let rotated = EncodeParams {
            rotate: true,
            ..EncodeParams::default()
        };

        let data = JpegFrameEncoder.encode(&frame(8, 4, Rotation::Rotate90), &rotated).unwrap();
        assert_eq!(decoded_dimensions(&data), (4, 8));

        let data = JpegFrameEncoder
            .encode(&frame(8, 4, Rotation::Rotate90), &EncodeParams::default())
            .unwrap();
        assert_eq!(decoded_dimensions(&data), (8, 4));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let bad = RawFrame::new(8, 4, vec![0; 10], Rotation::None);
        let err = JpegFrameEncoder.encode(&bad, &EncodeParams::default()).unwrap_err();
        assert!(matches!(err, EncodeError::InvalidFrame(_)));
    }
}
