//! WebDriver render backend
//!
//! Talks the W3C WebDriver protocol to a driver server (chromedriver by
//! default) over HTTP. One browser session per camera.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::render::{Region, RenderBackend, RenderError, RenderSession};
use crate::camera::CameraId;
use crate::config::RenderConfig;

/// W3C web element identifier key
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Delay between element lookups while waiting
const POLL_STEP: Duration = Duration::from_millis(250);

/// Pause between refresh and the element wait
const REFRESH_SETTLE: Duration = Duration::from_secs(1);

const REGION_SCRIPT: &str =
    "const r = arguments[0].getBoundingClientRect(); return {width: r.width, height: r.height};";

#[derive(Debug)]
struct PageOptions {
    browser_args: Vec<String>,
    ready_selector: String,
    frame_selector: String,
    video_selector: String,
    page_timeout: Duration,
    reload_timeout: Duration,
    video_timeout: Duration,
}

/// Opens one browser session per camera through a WebDriver server
#[derive(Debug, Clone)]
pub struct WebDriverBackend {
    client: Client,
    base_url: String,
    options: Arc<PageOptions>,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct DriverError {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Rect {
    width: f64,
    height: f64,
}

impl WebDriverBackend {
    pub fn new(config: &RenderConfig) -> Result<Self, RenderError> {
        let client = Client::builder()
            .timeout(config.call_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.webdriver_url.trim_end_matches('/').to_string(),
            options: Arc::new(PageOptions {
                browser_args: config.browser_args.clone(),
                ready_selector: config.ready_selector.clone(),
                frame_selector: config.frame_selector.clone(),
                video_selector: config.video_selector.clone(),
                page_timeout: config.page_timeout(),
                reload_timeout: config.reload_timeout(),
                video_timeout: config.video_timeout(),
            }),
        })
    }

    async fn new_session(&self) -> Result<String, RenderError> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "acceptInsecureCerts": true,
                    "goog:chromeOptions": { "args": self.options.browser_args },
                }
            }
        });

        let response = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&capabilities)
            .send()
            .await
            .map_err(|e| RenderError::Unavailable(format!("WebDriver server unreachable: {e}")))?;

        let value = decode_response(response, "new session").await?;
        let session: NewSession = serde_json::from_value(value)
            .map_err(|e| RenderError::Protocol(format!("new session response: {e}")))?;
        Ok(session.session_id)
    }
}

#[async_trait]
impl RenderBackend for WebDriverBackend {
    async fn open(
        &self,
        camera: CameraId,
        url: &str,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        let session_id = self.new_session().await?;
        debug!("WebDriver session {} created for {}", session_id, camera);

        let mut session = WebDriverSession {
            client: self.client.clone(),
            session_url: format!("{}/session/{}", self.base_url, session_id),
            camera,
            page_url: url.to_string(),
            options: self.options.clone(),
            frame: None,
            closed: false,
        };

        let loaded = tokio::time::timeout(self.options.page_timeout, session.load_page())
            .await
            .unwrap_or(Err(RenderError::Timeout("page load")));
        if let Err(e) = loaded {
            session.close().await;
            return Err(e);
        }

        info!("Loaded camera page for {}", camera);
        Ok(Box::new(session))
    }
}

struct WebDriverSession {
    client: Client,
    session_url: String,
    camera: CameraId,
    page_url: String,
    options: Arc<PageOptions>,
    /// Element id of the player frame on the current page
    frame: Option<String>,
    closed: bool,
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        command: &'static str,
    ) -> Result<Value, RenderError> {
        let request = self
            .client
            .request(method, format!("{}{}", self.session_url, path));
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };
        let response = request.send().await?;
        decode_response(response, command).await
    }

    async fn navigate(&self) -> Result<(), RenderError> {
        self.command(
            Method::POST,
            "/url",
            Some(json!({ "url": self.page_url })),
            "navigate",
        )
        .await?;
        Ok(())
    }

    async fn find_element(&self, selector: &str) -> Result<String, RenderError> {
        let value = self
            .command(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": selector })),
                "find element",
            )
            .await?;
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RenderError::Protocol(format!("element reference missing for {selector}")))
    }

    /// Poll for `selector` until it exists or `timeout` elapses
    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<String, RenderError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find_element(selector).await {
                Ok(element) => return Ok(element),
                Err(RenderError::NotReady(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(POLL_STEP).await;
                }
                Err(RenderError::NotReady(_)) => {
                    return Err(RenderError::NotReady(format!(
                        "{} did not appear within {:?}",
                        selector, timeout
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the ready marker and the player frame
    async fn await_player(&mut self, timeout: Duration) -> Result<(), RenderError> {
        self.frame = None;
        self.wait_for_element(&self.options.ready_selector, timeout)
            .await?;
        let frame = self
            .wait_for_element(&self.options.frame_selector, timeout)
            .await?;
        self.frame = Some(frame);
        Ok(())
    }

    async fn load_page(&mut self) -> Result<(), RenderError> {
        self.navigate().await?;
        self.await_player(self.options.page_timeout).await
    }

    async fn element_screenshot(&self, element: &str) -> Result<Vec<u8>, RenderError> {
        let value = self
            .command(
                Method::GET,
                &format!("/element/{element}/screenshot"),
                None,
                "element screenshot",
            )
            .await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| RenderError::Protocol("screenshot is not a string".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| RenderError::Protocol(format!("screenshot is not base64: {e}")))
    }

    /// Screenshot the video inside the player frame, or the frame itself
    /// when no video element shows up
    async fn screenshot_player(&self, frame: &str) -> Result<Vec<u8>, RenderError> {
        self.command(
            Method::POST,
            "/frame",
            Some(json!({ "id": element_ref(frame) })),
            "switch to frame",
        )
        .await?;

        let inner = match self
            .wait_for_element(&self.options.video_selector, self.options.video_timeout)
            .await
        {
            Ok(video) => self.element_screenshot(&video).await.map(Some),
            Err(RenderError::NotReady(reason)) => {
                debug!("No video element for {} ({}), using frame", self.camera, reason);
                Ok(None)
            }
            Err(e) => Err(e),
        };

        let back = self
            .command(Method::POST, "/frame/parent", Some(json!({})), "switch to parent frame")
            .await;

        match (inner?, back) {
            (Some(png), _) => Ok(png),
            (None, Ok(_)) => self.element_screenshot(frame).await,
            (None, Err(e)) => Err(e),
        }
    }
}

#[async_trait]
impl RenderSession for WebDriverSession {
    async fn region(&mut self) -> Result<Option<Region>, RenderError> {
        let Some(frame) = self.frame.as_deref() else {
            return Ok(None);
        };

        let value = self
            .command(
                Method::POST,
                "/execute/sync",
                Some(json!({ "script": REGION_SCRIPT, "args": [element_ref(frame)] })),
                "region query",
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }

        let rect: Rect = serde_json::from_value(value)
            .map_err(|e| RenderError::Protocol(format!("bounding box: {e}")))?;
        Ok(Some(Region {
            width: rect.width,
            height: rect.height,
        }))
    }

    async fn capture(&mut self, destination: &Path) -> Result<(), RenderError> {
        let frame = self
            .frame
            .clone()
            .ok_or_else(|| RenderError::NotReady("player frame not located".to_string()))?;
        let png = self.screenshot_player(&frame).await?;
        tokio::fs::write(destination, png).await?;
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), RenderError> {
        self.navigate().await?;
        self.command(Method::POST, "/refresh", Some(json!({})), "refresh")
            .await?;
        tokio::time::sleep(REFRESH_SETTLE).await;
        self.await_player(self.options.reload_timeout).await?;

        let Some(frame) = self.frame.as_deref() else {
            return Err(RenderError::NotReady("player frame not located".to_string()));
        };
        let src = self
            .command(
                Method::GET,
                &format!("/element/{frame}/attribute/src"),
                None,
                "read frame source",
            )
            .await?;
        if src.as_str().is_some_and(|src| src.contains("about:blank")) {
            return Err(RenderError::NotReady("player frame is blank after reload".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.frame = None;
        let deleted = self.command(Method::DELETE, "", None, "delete session").await;
        // Only after the request finished; a cancelled close falls back to Drop
        self.closed = true;
        match deleted {
            Ok(_) => debug!("WebDriver session for {} closed", self.camera),
            Err(e) => warn!("Failed to close WebDriver session for {}: {}", self.camera, e),
        }
    }
}

impl Drop for WebDriverSession {
    /// A session dropped without `close` (an open or close cancelled by a
    /// timeout) is deleted in the background
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("WebDriver session for {} dropped outside a runtime", self.camera);
            return;
        };
        let request = self.client.delete(self.session_url.as_str());
        let camera = self.camera;
        runtime.spawn(async move {
            match request.send().await {
                Ok(_) => debug!("Abandoned WebDriver session for {} deleted", camera),
                Err(e) => warn!("Failed to delete abandoned WebDriver session for {}: {}", camera, e),
            }
        });
    }
}

fn element_ref(element: &str) -> Value {
    let mut reference = serde_json::Map::new();
    reference.insert(ELEMENT_KEY.to_string(), Value::String(element.to_string()));
    Value::Object(reference)
}

/// Unwrap the `value` member of a driver response, mapping driver errors
async fn decode_response(response: Response, command: &'static str) -> Result<Value, RenderError> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| RenderError::Protocol(format!("{command} response is not JSON: {e}")))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let error: DriverError = serde_json::from_value(value).map_err(|_| {
        RenderError::Protocol(format!("{command} failed with HTTP {status}"))
    })?;
    Err(classify_driver_error(command, error))
}

fn classify_driver_error(command: &'static str, error: DriverError) -> RenderError {
    match error.error.as_str() {
        "invalid session id" | "no such window" | "session not created" => {
            RenderError::SessionLost(format!("{}: {}", error.error, error.message))
        }
        "no such element" | "no such frame" | "stale element reference" => {
            RenderError::NotReady(error.error.clone())
        }
        _ => RenderError::Command {
            command,
            message: format!("{}: {}", error.error, error.message),
        },
    }
}
