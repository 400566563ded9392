//! Typed errors for the daemon's building blocks.
//!
//! The binary and the supervisor loop wrap these in `anyhow` with context;
//! everything below them reports through these enums.

use std::path::PathBuf;
use thiserror::Error;

/// Reading the template or writing the rendered worker config failed.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write worker config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A worker output line that could not be turned into an event.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed classification line: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("connection error line without URL: {line}")]
    MissingUrl { line: String },

    #[error("classification for unknown source {source_id}")]
    UnknownSource { source_id: String },
}

/// Publishing to a telemetry sink failed.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{sink}: transport error: {message}")]
    Transport { sink: &'static str, message: String },

    #[error("{sink}: unexpected status {status}: {body}")]
    Status {
        sink: &'static str,
        status: u16,
        body: String,
    },

    #[error("{sink}: {message}")]
    Encode { sink: &'static str, message: String },
}

/// The worker process could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn worker {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        source: std::io::Error,
    },

    #[error("worker {executable} started without a {stream} pipe")]
    MissingPipe {
        executable: PathBuf,
        stream: &'static str,
    },
}

/// The discovery subscription could not be established.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon: {0}")]
    Daemon(String),

    #[error("failed to browse for {service_type}: {message}")]
    Browse {
        service_type: String,
        message: String,
    },
}
