//! camrelay
//!
//! Captures the live video region of up to nine rendered camera pages and
//! re-serves each as a multipart push stream over HTTP.

pub mod camera;
pub mod capture;
pub mod channel;
pub mod config;
pub mod logging;
pub mod placeholder;
pub mod server;
pub mod store;
pub mod supervisor;
