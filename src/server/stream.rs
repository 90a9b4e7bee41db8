//! Multipart push streams
//!
//! Each connection gets its own session that polls the frame store and
//! emits a part whenever the camera's frame is newer than the last one sent.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::Stream;
use std::convert::Infallible;
use tokio::time::Instant;
use tracing::{debug, info};

use super::wire;
use super::AppState;
use crate::camera::CameraId;

pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const CLOSING_BOUNDARY: &[u8] = b"--frame--\r\n";

/// One multipart part: boundary, headers, payload, trailing CRLF
pub fn multipart_part(content_type: &str, payload: &[u8]) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + payload.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(payload);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// `GET /stream/cam{N}`
pub async fn stream_camera(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Response {
    let Some(camera) = CameraId::from_slug(&slug) else {
        return (StatusCode::NOT_FOUND, "Camera not found").into_response();
    };

    info!("Stream client connected to {}", camera);
    let body = Body::from_stream(ClientSession::new(camera, state).into_stream());

    (
        [
            (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        body,
    )
        .into_response()
}

struct ClientSession {
    camera: CameraId,
    state: AppState,
    /// Timestamp of the last frame sent; `None` until a stored frame went out
    last_sent: Option<DateTime<Utc>>,
    /// When the fallback placeholder last went out
    last_fallback: Option<Instant>,
    finished: bool,
}

impl ClientSession {
    fn new(camera: CameraId, state: AppState) -> Self {
        Self {
            camera,
            state,
            last_sent: None,
            last_fallback: None,
            finished: false,
        }
    }

    fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            let part = session.next_part().await?;
            Some((Ok::<_, Infallible>(part), session))
        })
    }

    async fn next_part(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }

        loop {
            if self.state.stop.is_cancelled() {
                self.finished = true;
                debug!("Closing stream for {}", self.camera);
                return Some(Bytes::from_static(CLOSING_BOUNDARY));
            }

            if let Some(part) = self.poll_store().await {
                return Some(part);
            }

            tokio::select! {
                _ = self.state.stop.cancelled() => {}
                _ = tokio::time::sleep(self.state.stream.poll_interval) => {}
            }
        }
    }

    /// The next part to send, if one is due
    ///
    /// Stored frames go out once each. The fallback is repeated every
    /// `resend_interval` while nothing is stored.
    async fn poll_store(&mut self) -> Option<Bytes> {
        let now = Instant::now();

        let payload = match self.state.store.get(self.camera) {
            Some(frame) => {
                if self.last_sent.is_some_and(|sent| frame.updated <= sent) {
                    return None;
                }
                self.last_sent = Some(frame.updated);
                frame.bytes.clone()
            }
            None => {
                let fallback_due = self.last_fallback.map_or(true, |at| {
                    now.duration_since(at) >= self.state.stream.resend_interval
                });
                if !fallback_due {
                    return None;
                }
                self.last_fallback = Some(now);
                self.state.placeholders.fallback().cloned().unwrap_or_default()
            }
        };

        let settings = &self.state.stream;
        let (content_type, payload) =
            wire::prepare(payload, settings.format, settings.jpeg_quality).await;
        Some(multipart_part(content_type, &payload))
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        debug!("Stream session for {} ended", self.camera);
    }
}
