//! Static fallback images shown instead of live frames

use bytes::Bytes;
use std::path::Path;
use tracing::{info, warn};

use crate::config::PlaceholderConfig;

/// Which placeholder a camera is showing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    /// The camera slot has no source URL
    NoCamera,
    /// The source is configured but cannot be captured right now
    NoConnection,
}

/// Placeholder images, loaded once at startup. Either may be missing.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    no_camera: Option<Bytes>,
    no_connection: Option<Bytes>,
}

impl Placeholders {
    pub fn new(no_camera: Option<Bytes>, no_connection: Option<Bytes>) -> Self {
        Self {
            no_camera,
            no_connection,
        }
    }

    /// Read both images; a missing or unreadable file is logged and skipped
    pub async fn load(config: &PlaceholderConfig) -> Self {
        let (no_camera, no_connection) = tokio::join!(
            read_placeholder(&config.no_camera),
            read_placeholder(&config.no_connection),
        );
        Self {
            no_camera,
            no_connection,
        }
    }

    pub fn get(&self, kind: PlaceholderKind) -> Option<&Bytes> {
        match kind {
            PlaceholderKind::NoCamera => self.no_camera.as_ref(),
            PlaceholderKind::NoConnection => self.no_connection.as_ref(),
        }
    }

    /// Fallback for a camera with nothing published: "no camera", else
    /// "no connection"
    pub fn fallback(&self) -> Option<&Bytes> {
        self.no_camera.as_ref().or(self.no_connection.as_ref())
    }

    /// Frame published to every camera on shutdown. Empty when both images
    /// are missing so that sessions still see a new part.
    pub fn terminal(&self) -> Bytes {
        self.fallback().cloned().unwrap_or_default()
    }
}

async fn read_placeholder(path: &Path) -> Option<Bytes> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            info!("Loaded placeholder {:?} ({} bytes)", path, bytes.len());
            Some(Bytes::from(bytes))
        }
        Err(e) => {
            warn!("Placeholder {:?} unavailable: {}", path, e);
            None
        }
    }
}
