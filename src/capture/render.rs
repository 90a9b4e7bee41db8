//! Render capability interface
//!
//! A render backend loads a camera page and exposes its live video region.
//! The capture worker only talks to these traits, so any engine (or a test
//! double producing synthetic images) can sit behind them.

use async_trait::async_trait;
use std::path::Path;

use crate::camera::CameraId;

/// Bounding box of the video region in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render backend unavailable: {0}")]
    Unavailable(String),

    #[error("page not ready: {0}")]
    NotReady(String),

    #[error("{command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },

    #[error("render session lost: {0}")]
    SessionLost(String),

    #[error("render transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed render response: {0}")]
    Protocol(String),

    #[error("render I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl RenderError {
    /// Errors that leave the session in an unknown state. These call for a
    /// full restart rather than a page reload.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RenderError::SessionLost(_)
                | RenderError::Transport(_)
                | RenderError::Protocol(_)
                | RenderError::Io(_)
                | RenderError::Timeout(_)
        )
    }
}

/// Creates render sessions
#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Load `url` and locate its video region
    async fn open(
        &self,
        camera: CameraId,
        url: &str,
    ) -> Result<Box<dyn RenderSession>, RenderError>;
}

/// One loaded camera page, owned by a single capture worker
#[async_trait]
pub trait RenderSession: Send + Sync {
    /// Current bounding box of the video region, `None` if it is not there
    async fn region(&mut self) -> Result<Option<Region>, RenderError>;

    /// Write an image of the video region to `destination`
    async fn capture(&mut self, destination: &Path) -> Result<(), RenderError>;

    /// Refresh the page in place
    async fn reload(&mut self) -> Result<(), RenderError>;

    /// Release the session. Called at most once; errors are the backend's
    /// to log.
    async fn close(&mut self);
}
