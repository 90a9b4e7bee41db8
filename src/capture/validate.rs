//! Frame validation: black-frame check, width gate and crop, size gate
//!
//! Runs on a blocking thread; every step works on a decoded image.

use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;

use super::CaptureError;
use crate::config::ValidationConfig;

/// Why a decoded capture was not published
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("every sampled pixel is black")]
    BlackFrame,

    #[error("capture is {width}px wide, needs more than {min_width}px")]
    TooNarrow { width: u32, min_width: u32 },

    #[error("cropped frame encodes to {size} bytes, below {min_size}")]
    Undersized { size: u64, min_size: u64 },
}

/// A capture that passed every check, encoded as PNG
#[derive(Debug, Clone)]
pub struct ValidatedFrame {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct FrameValidator {
    stride: u32,
    min_width: u32,
    crop_margin: u32,
    min_encoded_bytes: u64,
}

impl FrameValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            stride: config.black_sample_stride.max(1),
            min_width: config.min_width,
            crop_margin: config.crop_margin,
            min_encoded_bytes: config.min_encoded_bytes,
        }
    }

    /// Decode a raw capture and run the full pipeline
    pub fn validate_capture(&self, raw: &[u8]) -> Result<ValidatedFrame, CaptureError> {
        let image = image::load_from_memory(raw).map_err(CaptureError::Decode)?;
        self.validate(&image)
    }

    pub fn validate(&self, image: &DynamicImage) -> Result<ValidatedFrame, CaptureError> {
        if self.is_black(image) {
            return Err(Rejection::BlackFrame.into());
        }

        let cropped = self.crop(image)?;
        let bytes = encode_png(&cropped).map_err(CaptureError::Encode)?;

        let size = bytes.len() as u64;
        if size < self.min_encoded_bytes {
            return Err(Rejection::Undersized {
                size,
                min_size: self.min_encoded_bytes,
            }
            .into());
        }

        Ok(ValidatedFrame {
            bytes: Bytes::from(bytes),
            width: cropped.width(),
            height: cropped.height(),
        })
    }

    /// True when every pixel on the sampling grid has R=G=B=0
    pub fn is_black(&self, image: &DynamicImage) -> bool {
        let (width, height) = image.dimensions();
        let step = self.stride as usize;
        for y in (0..height).step_by(step) {
            for x in (0..width).step_by(step) {
                let pixel = image.get_pixel(x, y);
                if pixel[0] != 0 || pixel[1] != 0 || pixel[2] != 0 {
                    return false;
                }
            }
        }
        true
    }

    /// Remove `crop_margin` pixels from both sides
    pub fn crop(&self, image: &DynamicImage) -> Result<DynamicImage, Rejection> {
        // The crop also needs at least one column left over
        let min_width = self.min_width.max(self.crop_margin.saturating_mul(2));
        let (width, height) = image.dimensions();
        if width <= min_width {
            return Err(Rejection::TooNarrow { width, min_width });
        }
        Ok(image.crop_imm(self.crop_margin, 0, width - 2 * self.crop_margin, height))
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::noise_image;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn validator() -> FrameValidator {
        FrameValidator::new(&ValidationConfig::default())
    }

    fn rejection(result: Result<ValidatedFrame, CaptureError>) -> Rejection {
        match result {
            Err(CaptureError::Rejected(rejection)) => rejection,
            other => panic!("expected a rejection, got {:?}", other.map(|f| f.width)),
        }
    }

    #[test]
    fn test_all_black_frame_is_rejected() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(640, 480));
        assert_eq!(rejection(validator().validate(&image)), Rejection::BlackFrame);
    }

    #[test]
    fn test_black_check_ignores_alpha() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(300, 200, Rgba([0, 0, 0, 255])));
        assert!(validator().is_black(&image));
    }

    #[test]
    fn test_single_lit_sample_passes_black_check() {
        let mut image = RgbImage::new(640, 480);
        image.put_pixel(320, 240, Rgb([0, 0, 1]));
        assert!(!validator().is_black(&DynamicImage::ImageRgb8(image)));
    }

    #[test]
    fn test_lit_pixel_off_grid_is_not_seen() {
        let mut image = RgbImage::new(640, 480);
        image.put_pixel(5, 5, Rgb([255, 255, 255]));
        assert!(validator().is_black(&DynamicImage::ImageRgb8(image)));
    }

    #[test]
    fn test_narrow_capture_is_rejected() {
        let image = DynamicImage::ImageRgb8(noise_image(132, 400, 7));
        assert_eq!(
            rejection(validator().validate(&image)),
            Rejection::TooNarrow {
                width: 132,
                min_width: 132
            }
        );
    }

    #[test]
    fn test_width_gate_covers_wide_margins() {
        let validator = FrameValidator::new(&ValidationConfig {
            min_width: 10,
            crop_margin: 100,
            ..ValidationConfig::default()
        });
        let image = DynamicImage::ImageRgb8(noise_image(150, 100, 1));
        assert!(matches!(
            validator.crop(&image),
            Err(Rejection::TooNarrow { min_width: 200, .. })
        ));
    }

    #[test]
    fn test_crop_keeps_height_and_removes_margins() {
        let image = DynamicImage::ImageRgb8(noise_image(640, 480, 3));
        let cropped = validator().crop(&image).unwrap();
        assert_eq!(cropped.dimensions(), (640 - 132, 480));
        assert_eq!(cropped.get_pixel(0, 0), image.get_pixel(66, 0));
    }

    #[test]
    fn test_width_200_crops_to_68() {
        let image = DynamicImage::ImageRgb8(noise_image(200, 600, 5));
        let frame = validator().validate(&image).unwrap();
        assert_eq!((frame.width, frame.height), (68, 600));
    }

    #[test]
    fn test_flat_frame_is_undersized() {
        // Compresses far below the size floor
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(800, 600, Rgb([40, 90, 160])));
        assert!(matches!(
            rejection(validator().validate(&image)),
            Rejection::Undersized { min_size: 102_400, .. }
        ));
    }

    #[test]
    fn test_noisy_frame_is_accepted_as_png() {
        let image = DynamicImage::ImageRgb8(noise_image(400, 300, 11));
        let frame = validator().validate(&image).unwrap();
        assert_eq!((frame.width, frame.height), (268, 300));
        assert!(frame.bytes.len() as u64 >= 102_400);
        assert_eq!(image::guess_format(&frame.bytes).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let result = validator().validate_capture(b"definitely not an image");
        assert!(matches!(result, Err(CaptureError::Decode(_))));
    }
}
