//! Capture worker
//!
//! One worker per camera. It owns the camera's render session, runs one
//! capture attempt per tick and decides what the camera shows: a live frame,
//! the "no camera" placeholder when unconfigured, or the "no connection"
//! placeholder while recovering. URL updates arrive on the worker's own
//! channel and take effect before the next tick.

use bytes::Bytes;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::render::{RenderBackend, RenderError, RenderSession};
use super::validate::{FrameValidator, ValidatedFrame};
use super::{CaptureError, HealthState, Remedy};
use crate::camera::{normalize_url, CameraId};
use crate::channel::{UrlUpdate, UrlUpdates};
use crate::config::Config;
use crate::placeholder::{PlaceholderKind, Placeholders};
use crate::store::{camera_dir, FrameStore, StoreError};

/// Transient screenshot written by the render session
pub const TEMP_CAPTURE_FILE: &str = "temp_capture.png";

/// Timing and validation settings shared by all workers
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub interval: Duration,
    pub reload_settle: Duration,
    pub restart_settle: Duration,
    pub call_timeout: Duration,
    pub capture_root: PathBuf,
    pub validator: FrameValidator,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.capture.interval(),
            reload_settle: config.capture.reload_settle(),
            restart_settle: config.capture.restart_settle(),
            call_timeout: config.render.call_timeout(),
            capture_root: config.capture.root.clone(),
            validator: FrameValidator::new(&config.validation),
        }
    }
}

/// Everything the workers share, built once by the supervisor
pub struct WorkerContext {
    pub store: Arc<FrameStore>,
    pub placeholders: Arc<Placeholders>,
    pub backend: Arc<dyn RenderBackend>,
    pub settings: WorkerSettings,
}

/// What the worker last published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shown {
    Nothing,
    Live,
    Placeholder(PlaceholderKind),
}

pub struct CaptureWorker {
    camera: CameraId,
    url: Option<String>,
    session: Option<Box<dyn RenderSession>>,
    shown: Shown,
    ctx: Arc<WorkerContext>,
    updates: UrlUpdates,
    health: watch::Sender<HealthState>,
    cancel: CancellationToken,
    temp_path: PathBuf,
}

impl CaptureWorker {
    pub fn new(
        camera: CameraId,
        url: Option<String>,
        ctx: Arc<WorkerContext>,
        updates: UrlUpdates,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<HealthState>) {
        let url = normalize_url(url.as_deref());
        let initial = if url.is_some() {
            HealthState::AwaitingRegion
        } else {
            HealthState::Unconfigured
        };
        let (health, health_rx) = watch::channel(initial);
        let temp_path =
            camera_dir(&ctx.settings.capture_root, camera).join(TEMP_CAPTURE_FILE);

        let worker = Self {
            camera,
            url,
            session: None,
            shown: Shown::Nothing,
            ctx,
            updates,
            health,
            cancel,
            temp_path,
        };
        (worker, health_rx)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled, then close the render session
    pub async fn run(mut self) {
        info!(
            "Capture worker for {} started ({})",
            self.camera,
            self.url.as_deref().unwrap_or("unconfigured")
        );

        if let Some(dir) = self.temp_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("Failed to create capture directory {:?}: {}", dir, e);
            }
        }

        let cancel = self.cancel.clone();
        let mut next_tick = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(update) = self.updates.recv() => {
                    if self.apply_update(update).await {
                        next_tick = Instant::now();
                    }
                }

                _ = tokio::time::sleep_until(next_tick) => {
                    let pause = tokio::select! {
                        _ = cancel.cancelled() => break,
                        pause = self.tick() => pause,
                    };
                    next_tick = Instant::now() + self.ctx.settings.interval + pause;
                }
            }
        }

        self.close_session().await;
        self.remove_temp().await;
        info!("Capture worker for {} stopped", self.camera);
    }

    /// Apply a URL event. Returns true when the source changed.
    async fn apply_update(&mut self, update: UrlUpdate) -> bool {
        let url = normalize_url(update.url.as_deref());
        if url == self.url {
            debug!("Source for {} unchanged, ignoring update", self.camera);
            return false;
        }

        info!(
            "Source for {} changed: {} -> {}",
            self.camera,
            self.url.as_deref().unwrap_or("none"),
            url.as_deref().unwrap_or("none")
        );
        self.close_session().await;
        self.url = url;

        if self.url.is_some() {
            self.set_health(HealthState::AwaitingRegion);
            // Hide the previous source while the new page loads
            self.show_placeholder(PlaceholderKind::NoConnection).await;
        } else {
            self.set_health(HealthState::Unconfigured);
        }
        true
    }

    /// One capture attempt. Returns the extra settle delay before the next.
    async fn tick(&mut self) -> Duration {
        let Some(url) = self.url.clone() else {
            self.set_health(HealthState::Unconfigured);
            self.show_placeholder(PlaceholderKind::NoCamera).await;
            return Duration::ZERO;
        };

        if self.session.is_none() {
            self.set_health(HealthState::AwaitingRegion);
            let opened = bounded(
                self.ctx.settings.call_timeout,
                "session open",
                self.ctx.backend.open(self.camera, &url),
            )
            .await;
            match opened {
                Ok(session) => {
                    info!("Render session opened for {}", self.camera);
                    self.session = Some(session);
                }
                Err(e) => {
                    warn!("Render session for {} unavailable: {}", self.camera, e);
                    self.show_placeholder(PlaceholderKind::NoConnection).await;
                    return self.ctx.settings.restart_settle;
                }
            }
        }

        let attempt = self.attempt().await;
        self.remove_temp().await;

        match attempt {
            Ok(frame) => {
                self.publish_live(frame).await;
                Duration::ZERO
            }
            Err(e) => self.recover(e).await,
        }
    }

    async fn attempt(&mut self) -> Result<ValidatedFrame, CaptureError> {
        let timeout = self.ctx.settings.call_timeout;
        let Some(session) = self.session.as_mut() else {
            return Err(CaptureError::Render(RenderError::SessionLost(
                "no open session".to_string(),
            )));
        };

        match bounded(timeout, "region query", session.region()).await {
            Ok(Some(region)) if region.width >= 1.0 && region.height >= 1.0 => {}
            Ok(_) => return Err(CaptureError::RegionUnavailable),
            Err(e) if e.is_fatal() => return Err(CaptureError::Render(e)),
            Err(e) => {
                debug!("Region query for {} failed: {}", self.camera, e);
                return Err(CaptureError::RegionUnavailable);
            }
        }

        match bounded(timeout, "capture", session.capture(&self.temp_path)).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(CaptureError::Render(e)),
            Err(e) => return Err(CaptureError::CaptureFailed(e)),
        }

        let raw = tokio::fs::read(&self.temp_path)
            .await
            .map_err(CaptureError::Unreadable)?;

        let validator = self.ctx.settings.validator.clone();
        tokio::task::spawn_blocking(move || validator.validate_capture(&raw))
            .await
            .map_err(|e| CaptureError::Task(e.to_string()))?
    }

    /// Show "no connection", then reload or restart as the error demands
    async fn recover(&mut self, error: CaptureError) -> Duration {
        self.set_health(HealthState::Reconnecting);
        self.show_placeholder(PlaceholderKind::NoConnection).await;

        match error.remedy() {
            Remedy::Reload => {
                warn!("Capture for {} failed: {}; reloading page", self.camera, error);
                match self.reload().await {
                    Ok(()) => return self.ctx.settings.reload_settle,
                    Err(e) => warn!(
                        "Reload for {} failed: {}; restarting render session",
                        self.camera, e
                    ),
                }
            }
            Remedy::Restart => error!(
                "Unexpected capture error for {}: {}; restarting render session",
                self.camera, error
            ),
        }

        self.restart().await;
        self.ctx.settings.restart_settle
    }

    async fn reload(&mut self) -> Result<(), RenderError> {
        let timeout = self.ctx.settings.call_timeout;
        let Some(session) = self.session.as_mut() else {
            return Err(RenderError::SessionLost("no open session".to_string()));
        };
        bounded(timeout, "reload", session.reload()).await
    }

    /// Close the current session and open a new one for the same URL
    async fn restart(&mut self) {
        self.close_session().await;
        self.set_health(HealthState::AwaitingRegion);

        let Some(url) = self.url.clone() else {
            return;
        };
        let opened = bounded(
            self.ctx.settings.call_timeout,
            "session open",
            self.ctx.backend.open(self.camera, &url),
        )
        .await;
        match opened {
            Ok(session) => {
                info!("Render session for {} restarted", self.camera);
                self.session = Some(session);
            }
            // The next tick retries the open
            Err(e) => warn!("Restart of render session for {} failed: {}", self.camera, e),
        }
    }

    async fn close_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let closed = bounded(self.ctx.settings.call_timeout, "session close", async {
            session.close().await;
            Ok(())
        })
        .await;
        if let Err(e) = closed {
            warn!("Render session for {} did not close cleanly: {}", self.camera, e);
        }
    }

    async fn publish_live(&mut self, frame: ValidatedFrame) {
        if !self.publish(frame.bytes).await {
            return;
        }
        if self.shown != Shown::Live {
            info!(
                "{} is live ({}x{})",
                self.camera, frame.width, frame.height
            );
        }
        self.shown = Shown::Live;
        self.set_health(HealthState::Capturing);
    }

    /// Publish a placeholder unless it is already showing
    async fn show_placeholder(&mut self, kind: PlaceholderKind) {
        if self.shown == Shown::Placeholder(kind) {
            return;
        }
        match self.ctx.placeholders.get(kind).cloned() {
            Some(bytes) => {
                if self.publish(bytes).await {
                    self.shown = Shown::Placeholder(kind);
                }
            }
            None => {
                debug!("No {:?} placeholder to show for {}", kind, self.camera);
                self.shown = Shown::Placeholder(kind);
            }
        }
    }

    async fn publish(&self, bytes: Bytes) -> bool {
        match self.ctx.store.publish(self.camera, bytes).await {
            Ok(_) => true,
            Err(StoreError::Sealed) => {
                debug!("Store sealed, dropping frame for {}", self.camera);
                false
            }
        }
    }

    async fn remove_temp(&self) {
        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {:?}: {}", self.temp_path, e),
        }
    }

    fn set_health(&self, state: HealthState) {
        self.health.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("{} health: {:?} -> {:?}", self.camera, current, state);
            *current = state;
            true
        });
    }
}

/// Run a render call under `timeout`; expiry becomes `RenderError::Timeout`
async fn bounded<T, F>(timeout: Duration, what: &'static str, call: F) -> Result<T, RenderError>
where
    F: Future<Output = Result<T, RenderError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| RenderError::Timeout(what))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::render::Region;
    use crate::capture::synthetic::noise_image;
    use crate::channel::config_channel;
    use crate::config::ValidationConfig;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// What the fake session does on its next capture attempt
    #[derive(Debug, Clone)]
    enum Step {
        Frame(Vec<u8>),
        NoRegion,
        CaptureFails,
        SessionDies,
    }

    #[derive(Default)]
    struct Script {
        steps: Mutex<VecDeque<Step>>,
        opens: AtomicUsize,
        closes: AtomicUsize,
        reloads: AtomicUsize,
        captures: AtomicUsize,
        fail_open: AtomicBool,
        fail_reload: AtomicBool,
    }

    impl Script {
        fn push(&self, step: Step) {
            self.steps.lock().unwrap().push_back(step);
        }

        fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    struct FakeBackend(Arc<Script>);

    #[async_trait]
    impl RenderBackend for FakeBackend {
        async fn open(
            &self,
            _camera: CameraId,
            _url: &str,
        ) -> Result<Box<dyn RenderSession>, RenderError> {
            self.0.opens.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_open.load(Ordering::SeqCst) {
                return Err(RenderError::Unavailable("scripted".to_string()));
            }
            Ok(Box::new(FakeSession(self.0.clone())))
        }
    }

    struct FakeSession(Arc<Script>);

    #[async_trait]
    impl RenderSession for FakeSession {
        async fn region(&mut self) -> Result<Option<Region>, RenderError> {
            let mut steps = self.0.steps.lock().unwrap();
            if matches!(steps.front(), Some(Step::NoRegion)) {
                steps.pop_front();
                return Ok(None);
            }
            Ok(Some(Region {
                width: 400.0,
                height: 300.0,
            }))
        }

        async fn capture(&mut self, destination: &Path) -> Result<(), RenderError> {
            let count = self.0.captures.fetch_add(1, Ordering::SeqCst) as u32;
            let step = self.0.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Frame(bytes)) => std::fs::write(destination, bytes)?,
                Some(Step::CaptureFails) => {
                    return Err(RenderError::NotReady("scripted".to_string()))
                }
                Some(Step::SessionDies) => {
                    return Err(RenderError::SessionLost("scripted".to_string()))
                }
                Some(Step::NoRegion) | None => {
                    std::fs::write(destination, png(noise_image(400, 300, count)))?
                }
            }
            Ok(())
        }

        async fn reload(&mut self) -> Result<(), RenderError> {
            self.0.reloads.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_reload.load(Ordering::SeqCst) {
                return Err(RenderError::NotReady("blank frame".to_string()));
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn png(image: RgbImage) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn cam(id: u8) -> CameraId {
        CameraId::new(id).unwrap()
    }

    struct Harness {
        script: Arc<Script>,
        store: Arc<FrameStore>,
        cancel: CancellationToken,
        health: watch::Receiver<HealthState>,
        sender: crate::channel::ConfigChannel,
        handle: JoinHandle<()>,
        _root: tempfile::TempDir,
    }

    fn start(camera: CameraId, url: Option<&str>, script: Arc<Script>) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(FrameStore::in_memory());
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            placeholders: Arc::new(Placeholders::new(
                Some(Bytes::from_static(b"nocam")),
                Some(Bytes::from_static(b"noconnect")),
            )),
            backend: Arc::new(FakeBackend(script.clone())),
            settings: WorkerSettings {
                interval: Duration::from_millis(10),
                reload_settle: Duration::from_millis(5),
                restart_settle: Duration::from_millis(5),
                call_timeout: Duration::from_secs(5),
                capture_root: root.path().to_path_buf(),
                validator: FrameValidator::new(&ValidationConfig::default()),
            },
        });

        let (sender, mut receivers) = config_channel();
        let updates = receivers.remove(camera.index());
        let cancel = CancellationToken::new();
        let (worker, health) = CaptureWorker::new(
            camera,
            url.map(str::to_string),
            ctx,
            updates,
            cancel.clone(),
        );
        Harness {
            script,
            store,
            cancel,
            health,
            sender,
            handle: worker.spawn(),
            _root: root,
        }
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn current(store: &FrameStore, camera: CameraId) -> Option<Bytes> {
        store.get(camera).map(|frame| frame.bytes.clone())
    }

    fn is_live(bytes: Option<Bytes>) -> bool {
        bytes.is_some_and(|b| image::guess_format(&b).ok() == Some(ImageFormat::Png))
    }

    #[tokio::test]
    async fn test_unconfigured_camera_shows_no_camera() {
        let script = Arc::new(Script::default());
        let h = start(cam(3), None, script.clone());

        wait_for("nocam", || {
            current(&h.store, cam(3)).as_deref() == Some(b"nocam".as_slice())
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(Script::count(&script.opens), 0);
        assert_eq!(*h.health.borrow(), HealthState::Unconfigured);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_valid_capture_is_cropped_and_published() {
        let script = Arc::new(Script::default());
        let h = start(cam(1), Some("http://portal/cam1"), script.clone());

        wait_for("live frame", || is_live(current(&h.store, cam(1)))).await;

        let bytes = current(&h.store, cam(1)).unwrap();
        let image = image::load_from_memory(&bytes).unwrap();
        assert_eq!((image.width(), image.height()), (400 - 132, 300));
        assert_eq!(*h.health.borrow(), HealthState::Capturing);
        assert_eq!(Script::count(&script.opens), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
        assert!(!h._root.path().join("cam1").join(TEMP_CAPTURE_FILE).exists());
    }

    #[tokio::test]
    async fn test_black_frame_reloads_without_restart() {
        let script = Arc::new(Script::default());
        script.push(Step::Frame(png(RgbImage::new(400, 300))));
        let h = start(cam(2), Some("http://portal/cam2"), script.clone());

        wait_for("reload", || Script::count(&script.reloads) == 1).await;
        wait_for("live frame", || is_live(current(&h.store, cam(2)))).await;

        assert_eq!(Script::count(&script.opens), 1);
        assert_eq!(Script::count(&script.closes), 0);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_region_shows_no_connection() {
        let script = Arc::new(Script::default());
        script.fail_reload.store(true, Ordering::SeqCst);
        for _ in 0..1000 {
            script.push(Step::NoRegion);
        }
        let h = start(cam(4), Some("http://portal/cam4"), script.clone());

        wait_for("noconnect", || {
            current(&h.store, cam(4)).as_deref() == Some(b"noconnect".as_slice())
        })
        .await;
        wait_for("restart", || Script::count(&script.opens) >= 2).await;

        assert_eq!(Script::count(&script.captures), 0);
        assert!(Script::count(&script.closes) >= 1);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_restarts_without_reload() {
        let script = Arc::new(Script::default());
        script.push(Step::SessionDies);
        let h = start(cam(5), Some("http://portal/cam5"), script.clone());

        wait_for("live after restart", || is_live(current(&h.store, cam(5)))).await;

        assert_eq!(Script::count(&script.reloads), 0);
        assert_eq!(Script::count(&script.opens), 2);
        assert_eq!(Script::count(&script.closes), 1);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_with_failed_reload_restarts() {
        let script = Arc::new(Script::default());
        script.fail_reload.store(true, Ordering::SeqCst);
        script.push(Step::CaptureFails);
        let h = start(cam(6), Some("http://portal/cam6"), script.clone());

        wait_for("live after restart", || is_live(current(&h.store, cam(6)))).await;

        assert_eq!(Script::count(&script.reloads), 1);
        assert_eq!(Script::count(&script.opens), 2);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_backend_keeps_retrying() {
        let script = Arc::new(Script::default());
        script.fail_open.store(true, Ordering::SeqCst);
        let h = start(cam(7), Some("http://portal/cam7"), script.clone());

        wait_for("retries", || Script::count(&script.opens) >= 3).await;
        assert_eq!(
            current(&h.store, cam(7)).as_deref(),
            Some(b"noconnect".as_slice())
        );

        script.fail_open.store(false, Ordering::SeqCst);
        wait_for("recovery", || is_live(current(&h.store, cam(7)))).await;
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_url_updates_switch_source() {
        let script = Arc::new(Script::default());
        let h = start(cam(8), None, script.clone());
        wait_for("nocam", || {
            current(&h.store, cam(8)).as_deref() == Some(b"nocam".as_slice())
        })
        .await;

        h.sender
            .send(UrlUpdate {
                camera: cam(8),
                url: Some("http://portal/cam8".to_string()),
            })
            .await
            .unwrap();
        wait_for("live", || is_live(current(&h.store, cam(8)))).await;

        // Same URL again is a no-op
        h.sender
            .send(UrlUpdate {
                camera: cam(8),
                url: Some("http://portal/cam8".to_string()),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Script::count(&script.opens), 1);

        h.sender
            .send(UrlUpdate {
                camera: cam(8),
                url: None,
            })
            .await
            .unwrap();
        wait_for("nocam again", || {
            current(&h.store, cam(8)).as_deref() == Some(b"nocam".as_slice())
        })
        .await;
        assert_eq!(Script::count(&script.closes), 1);
        assert_eq!(*h.health.borrow(), HealthState::Unconfigured);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_closes_session() {
        let script = Arc::new(Script::default());
        let h = start(cam(9), Some("http://portal/cam9"), script.clone());
        wait_for("live", || is_live(current(&h.store, cam(9)))).await;

        h.cancel.cancel();
        h.handle.await.unwrap();
        assert_eq!(Script::count(&script.opens), Script::count(&script.closes));
    }

    #[tokio::test]
    async fn test_sealed_store_keeps_terminal_frame() {
        let script = Arc::new(Script::default());
        let h = start(cam(1), Some("http://portal/cam1"), script.clone());
        wait_for("live", || is_live(current(&h.store, cam(1)))).await;

        h.store.seal();
        h.store
            .publish_terminal(cam(1), Bytes::from_static(b"bye"))
            .await;
        let captures = Script::count(&script.captures);
        wait_for("more captures", || Script::count(&script.captures) > captures + 2).await;

        assert_eq!(current(&h.store, cam(1)).as_deref(), Some(b"bye".as_slice()));
        h.cancel.cancel();
        h.handle.await.unwrap();
    }
}
