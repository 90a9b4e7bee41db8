//! Configuration management for camrelay

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::CameraUrls;

/// Environment variable overriding the configuration file location
pub const CONFIG_PATH_ENV: &str = "CAMRELAY_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Multipart stream behaviour
    #[serde(default)]
    pub stream: StreamConfig,

    /// Capture loop timing and frame persistence
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Frame validation thresholds
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Placeholder images
    #[serde(default)]
    pub placeholders: PlaceholderConfig,

    /// Render backend
    #[serde(default)]
    pub render: RenderConfig,

    /// Shutdown grace periods
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Camera source URLs
    #[serde(default)]
    pub cameras: CamerasConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP server
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Minimum time between accepted URL updates (ms)
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Send stored frames unchanged (frames are stored as PNG)
    #[default]
    Png,
    /// Re-encode every part as JPEG at `jpeg_quality`
    Jpeg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// How often a client session checks the store for a newer frame (ms)
    #[serde(default = "default_stream_poll")]
    pub poll_interval_ms: u64,

    /// Re-send the fallback placeholder at this period while no frame is stored (ms)
    #[serde(default = "default_resend_interval")]
    pub resend_interval_ms: u64,

    /// Image format of multipart parts
    #[serde(default)]
    pub format: WireFormat,

    /// JPEG quality used when `format = "jpeg"`
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Keep only `current.png`
    #[default]
    Current,
    /// Also keep the last `history_len` frames under `history/`
    History,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Delay between capture attempts (ms)
    #[serde(default = "default_capture_interval")]
    pub interval_ms: u64,

    /// Extra delay after a page reload (ms)
    #[serde(default = "default_reload_settle")]
    pub reload_settle_ms: u64,

    /// Extra delay after a session restart or failed open (ms)
    #[serde(default = "default_restart_settle")]
    pub restart_settle_ms: u64,

    /// Root directory for `cam{N}/` frame folders
    #[serde(default = "default_capture_root")]
    pub root: PathBuf,

    /// Mirror published frames to disk
    #[serde(default = "default_true")]
    pub persist_frames: bool,

    #[serde(default)]
    pub retention: Retention,

    /// Frames kept per camera with `retention = "history"`
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

/// Thresholds tuned against the original camera portal. They do not
/// generalize to arbitrary sources, so all of them are overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Pixel stride of the black-frame sampling grid
    #[serde(default = "default_black_stride")]
    pub black_sample_stride: u32,

    /// Captures this wide or narrower are rejected before cropping
    #[serde(default = "default_min_width")]
    pub min_width: u32,

    /// Pixels cropped from the left and the right edge
    #[serde(default = "default_crop_margin")]
    pub crop_margin: u32,

    /// Minimum PNG size of the cropped frame in bytes
    #[serde(default = "default_min_encoded_bytes")]
    pub min_encoded_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderConfig {
    /// Shown for unconfigured cameras
    #[serde(default = "default_no_camera")]
    pub no_camera: PathBuf,

    /// Shown while a configured camera cannot be captured
    #[serde(default = "default_no_connection")]
    pub no_connection: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Drive a browser through a WebDriver server (chromedriver)
    #[default]
    WebDriver,
    /// Generated test pattern, no browser needed
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Base URL of the WebDriver server
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Browser command line arguments
    #[serde(default = "default_browser_args")]
    pub browser_args: Vec<String>,

    /// Element that signals the camera page finished loading
    #[serde(default = "default_ready_selector")]
    pub ready_selector: String,

    /// Element hosting the player; its bounding box is the video region
    #[serde(default = "default_frame_selector")]
    pub frame_selector: String,

    /// Video element looked up inside the player frame
    #[serde(default = "default_video_selector")]
    pub video_selector: String,

    /// Deadline for loading the page and its elements when a session opens (s)
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,

    /// Wait for the page elements after a reload (s)
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,

    /// Wait for the video element inside the frame (s)
    #[serde(default = "default_video_timeout")]
    pub video_timeout_secs: u64,

    /// Upper bound for any single render call (s)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Time given to stream sessions to push the terminal placeholder (ms)
    #[serde(default = "default_placeholder_grace")]
    pub placeholder_grace_ms: u64,

    /// Time given to the server and workers to wind down (ms)
    #[serde(default = "default_drain_grace")]
    pub drain_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CamerasConfig {
    /// Source page per camera, in slot order; `""` leaves a slot unconfigured
    #[serde(default)]
    pub urls: Vec<String>,

    /// Write URL updates from the API back to this file
    #[serde(default = "default_true")]
    pub persist_updates: bool,
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_update_interval() -> u64 {
    3000
}

fn default_stream_poll() -> u64 {
    500
}

fn default_resend_interval() -> u64 {
    5000
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_capture_interval() -> u64 {
    1000
}

fn default_reload_settle() -> u64 {
    1000
}

fn default_restart_settle() -> u64 {
    3000
}

fn default_capture_root() -> PathBuf {
    PathBuf::from("capture")
}

fn default_history_len() -> usize {
    10
}

fn default_black_stride() -> u32 {
    10
}

fn default_min_width() -> u32 {
    132
}

fn default_crop_margin() -> u32 {
    66
}

fn default_min_encoded_bytes() -> u64 {
    100 * 1024
}

fn default_no_camera() -> PathBuf {
    PathBuf::from("resource").join("nocam.png")
}

fn default_no_connection() -> PathBuf {
    PathBuf::from("resource").join("noconnect.png")
}

fn default_webdriver_url() -> String {
    "http://127.0.0.1:9515".to_string()
}

fn default_browser_args() -> Vec<String> {
    [
        "--headless",
        "--disable-gpu",
        "--no-sandbox",
        "--window-size=1920,1080",
        "--disable-dev-shm-usage",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

fn default_ready_selector() -> String {
    "#ModalBodyPlayer".to_string()
}

fn default_frame_selector() -> String {
    "iframe".to_string()
}

fn default_video_selector() -> String {
    "video".to_string()
}

fn default_page_timeout() -> u64 {
    20
}

fn default_reload_timeout() -> u64 {
    25
}

fn default_video_timeout() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    60
}

fn default_placeholder_grace() -> u64 {
    2000
}

fn default_drain_grace() -> u64 {
    3000
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            update_interval_ms: default_update_interval(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_stream_poll(),
            resend_interval_ms: default_resend_interval(),
            format: WireFormat::default(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_capture_interval(),
            reload_settle_ms: default_reload_settle(),
            restart_settle_ms: default_restart_settle(),
            root: default_capture_root(),
            persist_frames: true,
            retention: Retention::default(),
            history_len: default_history_len(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            black_sample_stride: default_black_stride(),
            min_width: default_min_width(),
            crop_margin: default_crop_margin(),
            min_encoded_bytes: default_min_encoded_bytes(),
        }
    }
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            no_camera: default_no_camera(),
            no_connection: default_no_connection(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            webdriver_url: default_webdriver_url(),
            browser_args: default_browser_args(),
            ready_selector: default_ready_selector(),
            frame_selector: default_frame_selector(),
            video_selector: default_video_selector(),
            page_timeout_secs: default_page_timeout(),
            reload_timeout_secs: default_reload_timeout(),
            video_timeout_secs: default_video_timeout(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            placeholder_grace_ms: default_placeholder_grace(),
            drain_grace_ms: default_drain_grace(),
        }
    }
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            persist_updates: true,
        }
    }
}

impl ServerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn reload_settle(&self) -> Duration {
        Duration::from_millis(self.reload_settle_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

impl RenderConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn video_timeout(&self) -> Duration {
        Duration::from_secs(self.video_timeout_secs)
    }
}

impl ShutdownConfig {
    pub fn placeholder_grace(&self) -> Duration {
        Duration::from_millis(self.placeholder_grace_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

impl Config {
    /// Load configuration from `path`, `CAMRELAY_CONFIG`, or the default
    /// location. A missing file is created with defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path,
            None => match std::env::var_os(CONFIG_PATH_ENV) {
                Some(path) => PathBuf::from(path),
                None => Self::default_config_path()?,
            },
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.validate()?;
            config.config_path = Some(config_path);
            Ok(config)
        } else {
            // Create default config
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to its backing file
    pub fn save(&self) -> Result<()> {
        let (config_path, contents) = self.serialize_for_save()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        std::fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// `save` for callers on the runtime
    pub async fn save_async(&self) -> Result<()> {
        let (config_path, contents) = self.serialize_for_save()?;

        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        tokio::fs::write(config_path, contents)
            .await
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    fn serialize_for_save(&self) -> Result<(&Path, String)> {
        let Some(config_path) = self.config_path.as_deref() else {
            bail!("Configuration has no backing file");
        };
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        Ok((config_path, contents))
    }

    /// Get the config file path, if this configuration is backed by one
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Attach a backing file without touching it
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "camrelay", "camrelay")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Reject settings the capture loop or stream cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.capture.interval_ms == 0 {
            bail!("capture.interval_ms must be greater than zero");
        }
        if self.stream.poll_interval_ms == 0 {
            bail!("stream.poll_interval_ms must be greater than zero");
        }
        if self.validation.black_sample_stride == 0 {
            bail!("validation.black_sample_stride must be greater than zero");
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            bail!("stream.jpeg_quality must be within 1..=100");
        }
        if self.capture.retention == Retention::History && self.capture.history_len == 0 {
            bail!("capture.history_len must be greater than zero with history retention");
        }
        Ok(())
    }

    /// Camera source URLs, normalized to exactly nine slots
    pub fn camera_urls(&self) -> CameraUrls {
        CameraUrls::from_entries(self.cameras.urls.iter().map(Some))
    }

    /// Replace the camera source URLs
    pub fn set_camera_urls(&mut self, urls: &CameraUrls) {
        self.cameras.urls = urls.to_file_entries();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraId;

    #[test]
    fn test_defaults_match_tuned_thresholds() {
        let config = Config::default();
        assert_eq!(config.validation.black_sample_stride, 10);
        assert_eq!(config.validation.min_width, 132);
        assert_eq!(config.validation.crop_margin, 66);
        assert_eq!(config.validation.min_encoded_bytes, 102_400);
        assert_eq!(config.capture.interval(), Duration::from_secs(1));
        assert_eq!(config.server.bind, "0.0.0.0:5000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [capture]
            interval_ms = 250

            [stream]
            format = "jpeg"

            [cameras]
            urls = ["http://portal/cam1", "", "http://portal/cam3"]
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.interval_ms, 250);
        assert_eq!(config.capture.reload_settle_ms, 1000);
        assert_eq!(config.stream.format, WireFormat::Jpeg);
        assert_eq!(config.render.backend, BackendKind::WebDriver);

        let urls = config.camera_urls();
        assert_eq!(urls.get(CameraId::new(1).unwrap()), Some("http://portal/cam1"));
        assert_eq!(urls.get(CameraId::new(2).unwrap()), None);
        assert_eq!(urls.get(CameraId::new(3).unwrap()), Some("http://portal/cam3"));
        assert_eq!(urls.get(CameraId::new(9).unwrap()), None);
    }

    #[test]
    fn test_validate_rejects_zero_stride() {
        let mut config = Config::default();
        config.validation.black_sample_stride = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_missing_file_and_round_trips_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::load(Some(path.clone())).unwrap();
        assert!(path.exists());
        assert_eq!(config.camera_urls().configured(), 0);

        let mut urls = config.camera_urls();
        urls.set(CameraId::new(4).unwrap(), Some("http://portal/cam4".to_string()));
        config.set_camera_urls(&urls);
        config.save().unwrap();

        let reloaded = Config::load(Some(path)).unwrap();
        assert_eq!(reloaded.camera_urls(), urls);
    }

    #[test]
    fn test_save_without_backing_file_fails() {
        assert!(Config::default().save().is_err());
    }

    #[tokio::test]
    async fn test_save_async_creates_parent_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("camrelay.toml");

        let mut config = Config::default().with_config_path(path.clone());
        let mut urls = config.camera_urls();
        urls.set(CameraId::new(6).unwrap(), Some("http://portal/cam6".to_string()));
        config.set_camera_urls(&urls);
        config.save_async().await.unwrap();

        let reloaded = Config::load(Some(path)).unwrap();
        assert_eq!(reloaded.camera_urls(), urls);
        assert!(Config::default().save_async().await.is_err());
    }
}
