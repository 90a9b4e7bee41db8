//! Per-camera capture module
//!
//! Each camera slot is driven by a [`CaptureWorker`] that owns one render
//! session, turns its screenshots into validated frames and publishes them
//! (or a placeholder) to the frame store.
//!
//! Key pieces:
//! - [`RenderBackend`] / [`RenderSession`]: the render capability seam
//! - [`FrameValidator`]: black-frame check, crop and size gate
//! - [`WebDriverBackend`]: drives a real browser through a WebDriver server
//! - [`SyntheticBackend`]: generated frames for tests and demos

mod render;
mod synthetic;
mod validate;
mod webdriver;
mod worker;

pub use render::{Region, RenderBackend, RenderError, RenderSession};
pub use synthetic::{noise_image, SyntheticBackend};
pub use validate::{FrameValidator, Rejection, ValidatedFrame};
pub use webdriver::WebDriverBackend;
pub use worker::{CaptureWorker, WorkerContext, WorkerSettings, TEMP_CAPTURE_FILE};

use serde::Serialize;
use std::sync::Arc;

use crate::config::{BackendKind, RenderConfig};

/// Observable state of a capture worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No source URL; the "no camera" placeholder is shown
    Unconfigured,
    /// A session is open (or being opened) but no region was found yet
    AwaitingRegion,
    /// The last attempt published a live frame
    Capturing,
    /// The last attempt failed and recovery is underway
    Reconnecting,
}

/// Recovery action for a failed capture attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    /// Refresh the page, keep the session
    Reload,
    /// Close the session and open a new one
    Restart,
}

/// A failed capture attempt
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("video region unavailable")]
    RegionUnavailable,

    #[error("capture call failed: {0}")]
    CaptureFailed(RenderError),

    #[error("frame rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("render session failed: {0}")]
    Render(RenderError),

    #[error("captured image unreadable: {0}")]
    Unreadable(std::io::Error),

    #[error("captured image could not be decoded: {0}")]
    Decode(image::ImageError),

    #[error("cropped frame could not be encoded: {0}")]
    Encode(image::ImageError),

    #[error("validation task failed: {0}")]
    Task(String),
}

impl CaptureError {
    pub fn remedy(&self) -> Remedy {
        match self {
            CaptureError::RegionUnavailable
            | CaptureError::CaptureFailed(_)
            | CaptureError::Rejected(_) => Remedy::Reload,
            _ => Remedy::Restart,
        }
    }
}

/// Build the render backend selected in the configuration
pub fn backend_from_config(config: &RenderConfig) -> Result<Arc<dyn RenderBackend>, RenderError> {
    match config.backend {
        BackendKind::WebDriver => Ok(Arc::new(WebDriverBackend::new(config)?)),
        BackendKind::Synthetic => Ok(Arc::new(SyntheticBackend::default())),
    }
}
