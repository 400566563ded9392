//! Worker output protocol.
//!
//! The worker writes one record per line on stdout/stderr:
//!
//! - `{"label": .., "confidence": .., "source_id": .., "timestamp": ..}`
//!   for every classified audio frame,
//! - `WARNING: `, `ERROR: ` or `INFO: ` prefixed log text (unprefixed text
//!   is info),
//! - `Could not connect, URL: <url>, ...` / `Error resolving, URL: <url>, ...`
//!   when a stream source is unreachable.
//!
//! [`OutputRouter`] turns each line into zero or more [`Event`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

use crate::error::ProtocolError;
use crate::registry::{source_id, SourceRegistry};

const CONNECTION_ERROR_PREFIXES: [&str; 2] = ["Could not connect", "Error resolving"];
const URL_KEY: &str = "URL";

/// Severity of a worker log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of epoch timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl Precision {
    /// Parse the short form used by InfluxDB (`ns`, `us`, `ms`, `s`).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ns" => Some(Precision::Nanoseconds),
            "us" => Some(Precision::Microseconds),
            "ms" => Some(Precision::Milliseconds),
            "s" => Some(Precision::Seconds),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "us",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
        }
    }
}

/// Frame timestamp as the worker reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    /// Epoch count, unit defined by the deployment (the worker emits ns).
    Epoch(i64),
    /// Epoch count past `i64::MAX`. Kept so the detection still routes.
    Unsigned(u64),
    /// Fractional epoch count.
    Float(f64),
    /// RFC3339 text.
    Text(String),
}

impl Timestamp {
    /// Epoch value in `precision`. Epoch counts pass through unchanged
    /// (fractions truncated); text is parsed as RFC3339.
    pub fn epoch(&self, precision: Precision) -> Option<i64> {
        match self {
            Timestamp::Epoch(value) => Some(*value),
            Timestamp::Unsigned(value) => i64::try_from(*value).ok(),
            Timestamp::Float(value) => {
                let whole = value.trunc();
                (whole.is_finite() && whole >= i64::MIN as f64 && whole < i64::MAX as f64)
                    .then_some(whole as i64)
            }
            Timestamp::Text(text) => {
                let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(text).ok()?.into();
                match precision {
                    Precision::Nanoseconds => parsed.timestamp_nanos_opt(),
                    Precision::Microseconds => Some(parsed.timestamp_micros()),
                    Precision::Milliseconds => Some(parsed.timestamp_millis()),
                    Precision::Seconds => Some(parsed.timestamp()),
                }
            }
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Epoch(value) => write!(f, "{value}"),
            Timestamp::Unsigned(value) => write!(f, "{value}"),
            Timestamp::Float(value) => write!(f, "{value}"),
            Timestamp::Text(text) => f.write_str(text),
        }
    }
}

/// A detection attributed to a station.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationEvent {
    pub source_id: String,
    pub station: String,
    pub label: String,
    pub confidence: f64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// The worker failed to reach a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionErrorEvent {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Classification(ClassificationEvent),
    Log(LogEvent),
    ConnectionError(ConnectionErrorEvent),
}

/// JSON record printed for every classified frame.
#[derive(Debug, Deserialize)]
struct ClassificationLine {
    label: String,
    confidence: f64,
    source_id: u32,
    timestamp: Timestamp,
}

/// Classifies worker output lines.
#[derive(Debug, Clone)]
pub struct OutputRouter {
    background_label: String,
}

impl OutputRouter {
    pub fn new(background_label: impl Into<String>) -> Self {
        Self {
            background_label: background_label.into(),
        }
    }

    /// Turn one line into events, in the order they must be handled.
    ///
    /// Malformed lines are logged and yield whatever could still be
    /// extracted.
    pub fn route(&self, line: &str, registry: &SourceRegistry) -> Vec<Event> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Vec::new();
        }

        if line.starts_with('{') {
            return match self.parse_classification(line, registry) {
                Ok(Some(event)) => vec![Event::Classification(event)],
                Ok(None) => Vec::new(),
                Err(e) => {
                    error!(error = %e, "dropping worker line");
                    Vec::new()
                }
            };
        }

        let mut events = vec![Event::Log(parse_log(line))];
        match parse_connection_error(line) {
            Some(Ok(event)) => events.push(Event::ConnectionError(event)),
            Some(Err(e)) => error!(error = %e, "unparseable connection error"),
            None => {}
        }
        events
    }

    /// Parse a JSON classification line.
    ///
    /// `Ok(None)` means the frame carried no detection (empty or background
    /// label).
    pub fn parse_classification(
        &self,
        line: &str,
        registry: &SourceRegistry,
    ) -> Result<Option<ClassificationEvent>, ProtocolError> {
        let record: ClassificationLine = serde_json::from_str(line)?;

        let label = record.label.trim();
        if label.is_empty() || label == self.background_label {
            return Ok(None);
        }

        let id = source_id(record.source_id);
        let source = registry
            .get(&id)
            .ok_or_else(|| ProtocolError::UnknownSource { source_id: id.clone() })?;

        Ok(Some(ClassificationEvent {
            station: source.station().to_string(),
            source_id: id,
            label: label.to_string(),
            confidence: record.confidence,
            timestamp: record.timestamp,
        }))
    }
}

/// Severity and message of a free-text line.
pub fn parse_log(line: &str) -> LogEvent {
    let (level, message) = if let Some(rest) = line.strip_prefix("WARNING: ") {
        (LogLevel::Warning, rest)
    } else if let Some(rest) = line.strip_prefix("ERROR: ") {
        (LogLevel::Error, rest)
    } else if let Some(rest) = line.strip_prefix("INFO: ") {
        (LogLevel::Info, rest)
    } else {
        (LogLevel::Info, line)
    };

    LogEvent {
        level,
        message: message.to_string(),
    }
}

/// Extract the source URL from a connection failure line.
///
/// Returns `None` when the line is not a connection failure at all.
pub fn parse_connection_error(line: &str) -> Option<Result<ConnectionErrorEvent, ProtocolError>> {
    if !CONNECTION_ERROR_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return None;
    }

    // `key: value` pairs separated by commas; values may contain ':'
    let uri = line.split(',').find_map(|field| {
        let (key, value) = field.split_once(':').unwrap_or((field, ""));
        (key.trim() == URL_KEY).then(|| value.trim().to_string())
    });

    Some(match uri {
        Some(uri) if !uri.is_empty() => Ok(ConnectionErrorEvent { uri }),
        _ => Err(ProtocolError::MissingUrl {
            line: line.to_string(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        registry.upsert("10.0.0.5", 8080);
        registry
    }

    fn router() -> OutputRouter {
        OutputRouter::new("00_background")
    }

    #[test]
    fn test_classification_resolves_station() {
        let events = router().route(
            r#"{"label":"crow","confidence":0.92,"source_id":0,"timestamp":1690000000}"#,
            &registry(),
        );
        assert_eq!(
            events,
            vec![Event::Classification(ClassificationEvent {
                source_id: "source0".to_string(),
                station: "10.0.0.5".to_string(),
                label: "crow".to_string(),
                confidence: 0.92,
                timestamp: Timestamp::Epoch(1690000000),
            })]
        );
    }

    #[test]
    fn test_worker_format_with_extra_fields() {
        let line = r#"{"frame_num": 12, "timestamp": 1690000000123456789, "label": "Turdus merula ", "source_id": 0, "confidence": 0.734000}"#;
        let events = router().route(line, &registry());
        match &events[..] {
            [Event::Classification(event)] => {
                assert_eq!(event.label, "Turdus merula");
                assert_eq!(event.timestamp, Timestamp::Epoch(1690000000123456789));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_numeric_timestamp_shapes_still_route() {
        let events = router().route(
            r#"{"label":"crow","confidence":0.92,"source_id":0,"timestamp":1690000000.25}"#,
            &registry(),
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Classification(event) => {
                assert_eq!(event.timestamp, Timestamp::Float(1690000000.25));
                assert_eq!(event.timestamp.epoch(Precision::Seconds), Some(1690000000));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let events = router().route(
            r#"{"label":"crow","confidence":0.92,"source_id":0,"timestamp":18446744073709551615}"#,
            &registry(),
        );
        match &events[..] {
            [Event::Classification(event)] => {
                assert_eq!(event.timestamp, Timestamp::Unsigned(u64::MAX));
                assert_eq!(event.timestamp.epoch(Precision::Nanoseconds), None);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_empty_label_is_dropped() {
        let events = router().route(
            r#"{"label":"","confidence":0.5,"source_id":0,"timestamp":1690000001}"#,
            &registry(),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_background_label_is_dropped() {
        let events = router().route(
            r#"{"label":"00_background","confidence":0.99,"source_id":0,"timestamp":1}"#,
            &registry(),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_malformed_json_is_dropped() {
        let router = router();
        assert!(router.route(r#"{"label": "crow", "confid"#, &registry()).is_empty());
        assert!(matches!(
            router.parse_classification(r#"{"label": 3}"#, &registry()),
            Err(ProtocolError::MalformedJson(_))
        ));
    }

    #[test]
    fn test_unknown_source_is_error() {
        let result = router().parse_classification(
            r#"{"label":"crow","confidence":0.9,"source_id":7,"timestamp":1}"#,
            &registry(),
        );
        assert!(matches!(result, Err(ProtocolError::UnknownSource { .. })));
    }

    #[test]
    fn test_empty_line_is_ignored() {
        assert!(router().route("", &registry()).is_empty());
        assert!(router().route("\r\n", &registry()).is_empty());
    }

    #[test]
    fn test_log_prefixes() {
        assert_eq!(
            parse_log("WARNING: queue full"),
            LogEvent { level: LogLevel::Warning, message: "queue full".to_string() }
        );
        assert_eq!(parse_log("ERROR: boom").level, LogLevel::Error);
        assert_eq!(parse_log("INFO: ready").message, "ready");
        assert_eq!(
            parse_log("**PERF: 1.00 (1.00)"),
            LogEvent { level: LogLevel::Info, message: "**PERF: 1.00 (1.00)".to_string() }
        );
    }

    #[test]
    fn test_connection_error_yields_log_then_error() {
        let events = router().route("Could not connect, URL: 10.0.0.5:8080, reason: timeout", &registry());
        assert_eq!(
            events,
            vec![
                Event::Log(LogEvent {
                    level: LogLevel::Info,
                    message: "Could not connect, URL: 10.0.0.5:8080, reason: timeout".to_string(),
                }),
                Event::ConnectionError(ConnectionErrorEvent {
                    uri: "10.0.0.5:8080".to_string(),
                }),
            ]
        );
    }

    #[test]
    fn test_connection_error_url_keeps_colons() {
        let event = parse_connection_error(
            "Error resolving, URL: http://birdedge-02.local.:80/stream.wav, Redirect to: (NULL)",
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.uri, "http://birdedge-02.local.:80/stream.wav");
    }

    #[test]
    fn test_connection_error_without_url() {
        assert!(matches!(
            parse_connection_error("Could not connect, reason: timeout"),
            Some(Err(ProtocolError::MissingUrl { .. }))
        ));
        assert!(parse_connection_error("Connected to 10.0.0.5").is_none());

        let events = router().route("Could not connect, reason: timeout", &registry());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_text_timestamp_conversion() {
        let ts = Timestamp::Text("2023-07-22T04:26:40.000Z".to_string());
        assert_eq!(ts.epoch(Precision::Seconds), Some(1690000000));
        assert_eq!(ts.epoch(Precision::Milliseconds), Some(1690000000000));
        assert_eq!(Timestamp::Epoch(42).epoch(Precision::Seconds), Some(42));
        assert_eq!(Timestamp::Float(f64::NAN).epoch(Precision::Seconds), None);
        assert_eq!(Timestamp::Text("yesterday".to_string()).epoch(Precision::Seconds), None);
    }
}
