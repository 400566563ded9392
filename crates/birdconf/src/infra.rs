//! Infrastructure configuration - paths, discovery and telemetry.
//!
//! None of these change while the daemon is running.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for the worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Operator-provided INI template the worker config is rendered from.
    /// Default: configs/birdedged.conf
    pub template: PathBuf,

    /// Where the rendered worker config is written before every launch.
    /// Default: configs/dynamic.conf
    pub export: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            template: PathBuf::from("configs/birdedged.conf"),
            export: PathBuf::from("configs/dynamic.conf"),
        }
    }
}

/// mDNS service discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Browse for stream sources at all. Disable to run only the
    /// sources listed in the template.
    pub enabled: bool,

    /// Service type announced by the recorder stations.
    /// Default: _birdedge._tcp.local.
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: "_birdedge._tcp.local.".to_string(),
        }
    }
}

/// Logging and OpenTelemetry export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive).
    /// Default: warn
    pub log_level: String,

    /// OTLP gRPC endpoint. Empty disables export.
    pub otlp_endpoint: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            otlp_endpoint: String::new(),
        }
    }
}
