//! Telemetry sink configuration.

use serde::{Deserialize, Serialize};

/// InfluxDB v2 writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub enabled: bool,

    /// Default: http://localhost:9999
    pub url: String,

    /// API token, sent as `Authorization: Token <token>`.
    pub token: String,

    pub org: String,
    pub bucket: String,
    pub measurement: String,

    /// Timestamp precision of the worker's epoch timestamps (ns, us, ms, s).
    pub precision: String,

    pub timeout_ms: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:9999".to_string(),
            token: String::new(),
            org: "default".to_string(),
            bucket: "radiotracking".to_string(),
            measurement: "birdedge".to_string(),
            precision: "ns".to_string(),
            timeout_ms: 5_000,
        }
    }
}

/// ZMQ PUB message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub enabled: bool,

    /// Address the PUB socket binds to.
    /// Default: tcp://0.0.0.0:5590
    pub endpoint: String,

    /// Topics are `<prefix>/<hostname>`.
    pub topic_prefix: String,

    /// Field separator of the published records.
    pub delimiter: String,

    /// Also publish worker log lines on `<topic>/log`.
    pub publish_logs: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "tcp://0.0.0.0:5590".to_string(),
            topic_prefix: "birdedge".to_string(),
            delimiter: ",".to_string(),
            publish_logs: false,
        }
    }
}
