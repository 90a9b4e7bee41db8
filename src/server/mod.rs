//! HTTP front end
//!
//! Serves one multipart push stream per camera, the viewer pages and the
//! control API. Every handler works on a clone of [`AppState`].

mod api;
mod pages;
mod stream;
mod wire;

pub use api::{ApiError, SetUrlsResponse, UpdateGate};
pub use stream::{multipart_part, BOUNDARY, CLOSING_BOUNDARY, MULTIPART_CONTENT_TYPE};

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::camera::CameraId;
use crate::capture::HealthState;
use crate::channel::ConfigChannel;
use crate::config::{Config, StreamConfig, WireFormat};
use crate::placeholder::Placeholders;
use crate::store::FrameStore;

/// Per-session stream behaviour
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub resend_interval: Duration,
    pub format: WireFormat,
    pub jpeg_quality: u8,
}

impl StreamSettings {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            resend_interval: config.resend_interval(),
            format: config.format,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FrameStore>,
    pub placeholders: Arc<Placeholders>,
    pub channel: ConfigChannel,
    /// Live configuration; URL updates are written back through it
    pub config: Arc<Mutex<Config>>,
    pub gate: Arc<UpdateGate>,
    pub stream: StreamSettings,
    /// One receiver per camera, in camera order
    pub health: Arc<Vec<watch::Receiver<HealthState>>>,
    /// Cancelled when the server must stop; open streams end on it
    pub stop: CancellationToken,
    /// Cancelled to request the shutdown protocol
    pub shutdown: CancellationToken,
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(pages::index))
        .route("/stream/:camera", get(stream::stream_camera))
        .route("/shutdown", get(api::shutdown))
        .route("/api/set_urls", post(api::set_urls))
        .route("/api/status", get(api::status));

    for camera in CameraId::all() {
        router = router.route(
            &format!("/{}", camera.slug()),
            get(move || pages::viewer(camera)),
        );
    }

    router.with_state(state)
}

/// The bound HTTP server, ready to run
pub struct StreamServer {
    listener: TcpListener,
    state: AppState,
}

impl StreamServer {
    pub fn new(listener: TcpListener, state: AppState) -> Self {
        Self { listener, state }
    }

    /// Serve until the state's stop token is cancelled
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let stop = self.state.stop.clone();
            let addr = self.listener.local_addr().ok();
            let app = create_router(self.state);

            if let Some(addr) = addr {
                info!("Stream server listening on http://{}", addr);
            }

            let result = axum::serve(self.listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await;
            match result {
                Ok(()) => info!("Stream server stopped"),
                Err(e) => error!("Stream server failed: {}", e),
            }
        })
    }
}
