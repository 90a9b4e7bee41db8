//! Runtime reconfiguration channel
//!
//! Carries `(camera, url-or-null)` events from the control API to the
//! capture worker that owns the camera. Each worker has its own bounded
//! queue, so events are never broadcast beyond their owner.

use tokio::sync::mpsc;

use crate::camera::{CameraId, CAMERA_COUNT};

/// Per-camera queue depth
pub const CHANNEL_CAPACITY: usize = 8;

/// A new source for one camera; `url: None` unconfigures it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlUpdate {
    pub camera: CameraId,
    pub url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("capture worker for {0} is no longer running")]
    WorkerGone(CameraId),
}

/// Sending half, cloned into the HTTP state
#[derive(Debug, Clone)]
pub struct ConfigChannel {
    senders: Vec<mpsc::Sender<UrlUpdate>>,
}

/// Receiving half for one worker
pub type UrlUpdates = mpsc::Receiver<UrlUpdate>;

/// Create the channel. Receivers are returned in camera order.
pub fn config_channel() -> (ConfigChannel, Vec<UrlUpdates>) {
    let (senders, receivers) = (0..CAMERA_COUNT)
        .map(|_| mpsc::channel(CHANNEL_CAPACITY))
        .unzip();
    (ConfigChannel { senders }, receivers)
}

impl ConfigChannel {
    /// Deliver `update` to its camera's worker, waiting if the queue is full
    pub async fn send(&self, update: UrlUpdate) -> Result<(), ChannelError> {
        let camera = update.camera;
        self.senders[camera.index()]
            .send(update)
            .await
            .map_err(|_| ChannelError::WorkerGone(camera))
    }
}
