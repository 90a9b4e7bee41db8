//! Shared frame store
//!
//! Holds at most one current frame per camera. Each camera has a single
//! writer (its capture worker, plus the supervisor during shutdown) and any
//! number of readers (stream sessions). Readers load an `Arc` snapshot
//! without locking, so they see either a complete earlier frame or the new
//! one, never a partial write.
//!
//! Frames can additionally be mirrored to disk as `cam{N}/current.png`
//! (staged then renamed), optionally keeping a bounded history.

mod persist;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::camera::{CameraId, CAMERA_COUNT};
use crate::config::{CaptureConfig, Retention};

pub use persist::{CURRENT_FILE, HISTORY_DIR, STAGING_FILE};

/// A validated frame as served to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFrame {
    /// Encoded image bytes (may be empty for a missing placeholder)
    pub bytes: Bytes,
    /// Publication time; strictly increases per camera
    pub updated: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("frame store is sealed for shutdown")]
    Sealed,
}

/// How published frames are kept on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Only the current frame
    Current,
    /// Current frame plus the last `keep` frames, oldest pruned by mtime
    History { keep: usize },
}

#[derive(Debug)]
struct Slot {
    current: ArcSwapOption<PublishedFrame>,
    /// Serializes writers; readers never take it
    write_guard: Mutex<()>,
}

#[derive(Debug)]
struct Persistence {
    root: PathBuf,
    retention: RetentionPolicy,
}

/// The at-most-one-frame-per-camera publication point
#[derive(Debug)]
pub struct FrameStore {
    slots: Vec<Slot>,
    persistence: Option<Persistence>,
    sealed: AtomicBool,
}

/// Directory holding a camera's frames under `root`
pub fn camera_dir(root: &Path, camera: CameraId) -> PathBuf {
    root.join(camera.slug())
}

impl FrameStore {
    /// A store that keeps frames in memory only
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    /// A store that also mirrors frames below `root`
    pub fn persistent(root: impl Into<PathBuf>, retention: RetentionPolicy) -> Self {
        Self::build(Some(Persistence {
            root: root.into(),
            retention,
        }))
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        if !config.persist_frames {
            return Self::in_memory();
        }
        let retention = match config.retention {
            Retention::Current => RetentionPolicy::Current,
            Retention::History => RetentionPolicy::History {
                keep: config.history_len,
            },
        };
        Self::persistent(config.root.clone(), retention)
    }

    fn build(persistence: Option<Persistence>) -> Self {
        let slots = (0..CAMERA_COUNT)
            .map(|_| Slot {
                current: ArcSwapOption::empty(),
                write_guard: Mutex::new(()),
            })
            .collect();
        Self {
            slots,
            persistence,
            sealed: AtomicBool::new(false),
        }
    }

    /// Current frame for `camera`, or `None` if nothing was ever published
    pub fn get(&self, camera: CameraId) -> Option<Arc<PublishedFrame>> {
        self.slots[camera.index()].current.load_full()
    }

    /// Replace the camera's current frame. Fails once the store is sealed.
    pub async fn publish(
        &self,
        camera: CameraId,
        bytes: Bytes,
    ) -> Result<DateTime<Utc>, StoreError> {
        let slot = &self.slots[camera.index()];
        let _guard = slot.write_guard.lock().await;
        // Checked under the guard so a live frame can never land after the
        // terminal placeholder
        if self.is_sealed() {
            return Err(StoreError::Sealed);
        }
        Ok(self.write(camera, slot, bytes).await)
    }

    /// Publish the shutdown placeholder, ignoring the seal
    pub async fn publish_terminal(&self, camera: CameraId, bytes: Bytes) -> DateTime<Utc> {
        let slot = &self.slots[camera.index()];
        let _guard = slot.write_guard.lock().await;
        self.write(camera, slot, bytes).await
    }

    /// Stop accepting ordinary publishes
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    async fn write(&self, camera: CameraId, slot: &Slot, bytes: Bytes) -> DateTime<Utc> {
        let previous = slot.current.load_full().map(|frame| frame.updated);
        let updated = next_timestamp(previous);

        if let Some(persistence) = &self.persistence {
            let dir = camera_dir(&persistence.root, camera);
            if let Err(e) =
                persist::persist_frame(&dir, &bytes, updated, persistence.retention).await
            {
                warn!("Failed to mirror frame for {} to {:?}: {}", camera, dir, e);
            }
        }

        slot.current
            .store(Some(Arc::new(PublishedFrame { bytes, updated })));
        debug!("Published frame for {} at {}", camera, updated);
        updated
    }
}

/// `now`, bumped past `previous` when the clock has not moved forward
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}
