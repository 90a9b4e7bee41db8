//! Synthetic render backend
//!
//! Produces random-noise frames without a browser. Noise compresses badly,
//! so the frames clear the size gate after cropping.

use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use std::io::{self, Cursor};
use std::path::Path;
use tracing::debug;

use super::render::{Region, RenderBackend, RenderError, RenderSession};
use crate::camera::CameraId;

const DEFAULT_WIDTH: u32 = 480;
const DEFAULT_HEIGHT: u32 = 320;

/// Deterministic RGB noise
pub fn noise_image(width: u32, height: u32, seed: u32) -> RgbImage {
    // xorshift32 must not start at zero
    let mut state = seed.wrapping_mul(0x9E37_79B9) | 1;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };
    RgbImage::from_fn(width, height, |_, _| {
        let [r, g, b, _] = next().to_le_bytes();
        image::Rgb([r, g, b])
    })
}

#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    width: u32,
    height: u32,
}

impl SyntheticBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

#[async_trait]
impl RenderBackend for SyntheticBackend {
    async fn open(
        &self,
        camera: CameraId,
        url: &str,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        debug!("Opening synthetic session for {} ({})", camera, url);
        Ok(Box::new(SyntheticSession {
            camera,
            width: self.width,
            height: self.height,
            frames: 0,
        }))
    }
}

struct SyntheticSession {
    camera: CameraId,
    width: u32,
    height: u32,
    frames: u32,
}

#[async_trait]
impl RenderSession for SyntheticSession {
    async fn region(&mut self) -> Result<Option<Region>, RenderError> {
        Ok(Some(Region {
            width: f64::from(self.width),
            height: f64::from(self.height),
        }))
    }

    async fn capture(&mut self, destination: &Path) -> Result<(), RenderError> {
        self.frames = self.frames.wrapping_add(1);
        let seed = u32::from(self.camera.get()) << 24 ^ self.frames;
        let (width, height) = (self.width, self.height);

        let png = tokio::task::spawn_blocking(move || {
            let mut buffer = Cursor::new(Vec::new());
            noise_image(width, height, seed)
                .write_to(&mut buffer, ImageFormat::Png)
                .map(|_| buffer.into_inner())
                .map_err(io::Error::other)
        })
        .await
        .map_err(io::Error::other)??;

        tokio::fs::write(destination, png).await?;
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    async fn close(&mut self) {
        debug!(
            "Closed synthetic session for {} after {} frame(s)",
            self.camera, self.frames
        );
    }
}
