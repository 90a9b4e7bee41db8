//! Control API: URL updates, status and shutdown

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::AppState;
use crate::camera::{normalize_url, CameraId, CAMERA_COUNT};
use crate::capture::HealthState;
use crate::channel::UrlUpdate;

/// Bodies larger than this are rejected before parsing
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("URL updates are limited to one every {}s", .0.as_secs_f32())]
    RateLimited(Duration),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Admits at most one accepted update per interval
#[derive(Debug)]
pub struct UpdateGate {
    min_interval: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl UpdateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: Mutex::new(None),
        }
    }

    /// Record an accepted update now, unless one was accepted too recently
    pub fn try_acquire(&self) -> bool {
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if let Some(at) = *last {
            if now.duration_since(at) < self.min_interval {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UrlPayload {
    Wrapped { urls: Vec<Option<String>> },
    Bare(Vec<Option<String>>),
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetUrlsResponse {
    pub updated: Vec<u8>,
}

/// Parse and check a `set_urls` body; blank entries become `None`
fn parse_url_payload(body: &[u8]) -> Result<Vec<Option<String>>, ApiError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(ApiError::BadRequest(format!(
            "payload exceeds {MAX_BODY_BYTES} bytes"
        )));
    }

    let payload: UrlPayload = serde_json::from_slice(body).map_err(|_| {
        ApiError::BadRequest(
            "expected {\"urls\": [...]} or an array of URL strings or nulls".to_string(),
        )
    })?;
    let entries = match payload {
        UrlPayload::Wrapped { urls } => urls,
        UrlPayload::Bare(urls) => urls,
    };

    if entries.len() > CAMERA_COUNT {
        return Err(ApiError::BadRequest(format!(
            "at most {CAMERA_COUNT} URLs are accepted, got {}",
            entries.len()
        )));
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let url = normalize_url(entry.as_deref());
            if let Some(url) = &url {
                check_source_url(url).map_err(|reason| {
                    ApiError::BadRequest(format!("entry {}: {}", index + 1, reason))
                })?;
            }
            Ok(url)
        })
        .collect()
}

fn check_source_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL {url:?}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported scheme {other:?}")),
    }
}

/// `POST /api/set_urls`
pub async fn set_urls(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SetUrlsResponse>, ApiError> {
    let entries = parse_url_payload(&body)?;

    if !state.gate.try_acquire() {
        return Err(ApiError::RateLimited(state.gate.min_interval()));
    }

    let updates: Vec<UrlUpdate> = entries
        .into_iter()
        .zip(CameraId::all())
        .map(|(url, camera)| UrlUpdate { camera, url })
        .collect();

    {
        let mut config = state.config.lock().await;
        let mut urls = config.camera_urls();
        for update in &updates {
            urls.set(update.camera, update.url.clone());
        }
        config.set_camera_urls(&urls);

        if config.cameras.persist_updates && config.config_path().is_some() {
            if let Err(e) = config.save_async().await {
                warn!("Failed to persist camera URLs: {:#}", e);
            }
        }
    }

    let updated: Vec<u8> = updates.iter().map(|update| update.camera.get()).collect();
    for update in updates {
        if let Err(e) = state.channel.send(update).await {
            warn!("{}", e);
        }
    }

    info!("Camera URLs updated for {:?}", updated);
    Ok(Json(SetUrlsResponse { updated }))
}

#[derive(Debug, Serialize)]
pub struct CameraStatus {
    pub id: CameraId,
    pub configured: bool,
    pub state: HealthState,
    pub last_frame: Option<DateTime<Utc>>,
}

/// `GET /api/status`
pub async fn status(State(state): State<AppState>) -> Json<Vec<CameraStatus>> {
    let urls = state.config.lock().await.camera_urls();
    let cameras = urls
        .iter()
        .zip(state.health.iter())
        .map(|((camera, url), health)| CameraStatus {
            id: camera,
            configured: url.is_some(),
            state: *health.borrow(),
            last_frame: state.store.get(camera).map(|frame| frame.updated),
        })
        .collect();
    Json(cameras)
}

/// `GET /shutdown`
pub async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    info!("Shutdown requested over HTTP");
    state.shutdown.cancel();
    (StatusCode::OK, "Shutdown initiated")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_and_bare_payloads() {
        let wrapped = parse_url_payload(br#"{"urls": ["http://a/1", null, " "]}"#).unwrap();
        assert_eq!(wrapped, vec![Some("http://a/1".to_string()), None, None]);

        let bare = parse_url_payload(br#"["https://a/1"]"#).unwrap();
        assert_eq!(bare, vec![Some("https://a/1".to_string())]);
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        assert!(matches!(parse_url_payload(b"not json"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_url_payload(b"{\"urls\": 5}"), Err(ApiError::BadRequest(_))));
        assert!(matches!(
            parse_url_payload(br#"["ftp://a/1"]"#),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            parse_url_payload(br#"["no scheme"]"#),
            Err(ApiError::BadRequest(_))
        ));

        let ten: Vec<String> = (0..10).map(|i| format!("\"http://a/{i}\"")).collect();
        let body = format!("[{}]", ten.join(","));
        assert!(matches!(
            parse_url_payload(body.as_bytes()),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_gate_admits_one_update_per_interval() {
        let gate = UpdateGate::new(Duration::from_secs(60));
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());

        let open = UpdateGate::new(Duration::ZERO);
        assert!(open.try_acquire());
        assert!(open.try_acquire());
    }

    #[test]
    fn test_error_status_codes() {
        let bad = ApiError::BadRequest("x".into()).into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        let limited = ApiError::RateLimited(Duration::from_secs(3)).into_response();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
