//! Helpers for driving a relay over HTTP

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use camrelay::capture::SyntheticBackend;
use camrelay::config::{BackendKind, Config};
use camrelay::placeholder::Placeholders;
use camrelay::supervisor::{Relay, RunningRelay};

pub const NOCAM: &[u8] = b"NOCAM-PLACEHOLDER";
pub const NOCONNECT: &[u8] = b"NOCONNECT-PLACEHOLDER";

/// Width of synthetic frames after the default crop
pub const LIVE_WIDTH: u32 = 480 - 2 * 66;

/// Fast timings, synthetic backend, everything under `dir`
pub fn test_config(dir: &Path, urls: &[&str]) -> Config {
    let nocam = dir.join("nocam.png");
    let noconnect = dir.join("noconnect.png");
    std::fs::write(&nocam, NOCAM).unwrap();
    std::fs::write(&noconnect, NOCONNECT).unwrap();

    let mut config = Config::default().with_config_path(dir.join("config.toml"));
    config.server.bind = "127.0.0.1:0".to_string();
    config.stream.poll_interval_ms = 20;
    config.stream.resend_interval_ms = 60_000;
    config.capture.interval_ms = 50;
    config.capture.reload_settle_ms = 20;
    config.capture.restart_settle_ms = 20;
    config.capture.root = dir.join("capture");
    config.placeholders.no_camera = nocam;
    config.placeholders.no_connection = noconnect;
    config.render.backend = BackendKind::Synthetic;
    config.render.call_timeout_secs = 10;
    config.shutdown.placeholder_grace_ms = 300;
    config.shutdown.drain_grace_ms = 2000;
    config.cameras.urls = urls.iter().map(|url| url.to_string()).collect();
    config
}

pub async fn start_relay(config: Config) -> RunningRelay {
    let placeholders = Placeholders::load(&config.placeholders).await;
    Relay::new(config, std::sync::Arc::new(SyntheticBackend::default()), placeholders)
        .bind()
        .await
        .unwrap()
        .start()
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

#[derive(Debug, PartialEq, Eq)]
pub enum Part {
    Frame { content_type: String, payload: Vec<u8> },
    End,
}

/// Incremental parser for a `multipart/x-mixed-replace; boundary=frame` body
pub struct PartReader {
    response: reqwest::Response,
    buffer: Vec<u8>,
}

impl PartReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: Vec::new(),
        }
    }

    /// Next part, or `None` once the body has ended
    pub async fn next_part(&mut self) -> Option<Part> {
        tokio::time::timeout(Duration::from_secs(15), self.read_part())
            .await
            .expect("timed out waiting for a multipart part")
    }

    /// Next part if one arrives within `wait`
    pub async fn part_within(&mut self, wait: Duration) -> Option<Option<Part>> {
        tokio::time::timeout(wait, self.read_part()).await.ok()
    }

    async fn read_part(&mut self) -> Option<Part> {
        loop {
            if let Some(part) = self.parse() {
                return Some(part);
            }
            match self.response.chunk().await.unwrap() {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    assert!(self.buffer.is_empty(), "body ended mid-part");
                    return None;
                }
            }
        }
    }

    fn parse(&mut self) -> Option<Part> {
        const CLOSING: &[u8] = b"--frame--\r\n";
        const OPENING: &[u8] = b"--frame\r\n";

        if self.buffer.len() >= CLOSING.len() && self.buffer.starts_with(CLOSING) {
            self.buffer.drain(..CLOSING.len());
            return Some(Part::End);
        }
        if self.buffer.len() < OPENING.len() {
            return None;
        }
        assert!(self.buffer.starts_with(OPENING), "part does not start with the boundary");

        let header_end = find(&self.buffer, b"\r\n\r\n")?;
        let headers = std::str::from_utf8(&self.buffer[OPENING.len()..header_end]).unwrap();
        let mut content_type = String::new();
        let mut length = None;
        for line in headers.split("\r\n") {
            if let Some(value) = line.strip_prefix("Content-Type: ") {
                content_type = value.to_string();
            } else if let Some(value) = line.strip_prefix("Content-Length: ") {
                length = Some(value.parse::<usize>().unwrap());
            }
        }
        let length = length.expect("part without Content-Length");

        let body_start = header_end + 4;
        let part_end = body_start + length + 2;
        if self.buffer.len() < part_end {
            return None;
        }
        assert_eq!(&self.buffer[body_start + length..part_end], b"\r\n");
        let payload = self.buffer[body_start..body_start + length].to_vec();
        self.buffer.drain(..part_end);
        Some(Part::Frame {
            content_type,
            payload,
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Width of a PNG payload, `None` for anything else
pub fn png_width(payload: &[u8]) -> Option<u32> {
    if image::guess_format(payload).ok()? != image::ImageFormat::Png {
        return None;
    }
    image::load_from_memory(payload).ok().map(|image| image.width())
}
