//! InfluxDB v2 writer.
//!
//! One line-protocol point per classification:
//!
//! ```text
//! birdedge,station=10.0.0.5,label=Turdus\ merula confidence=0.92 1690000000000000000
//! ```

use async_trait::async_trait;
use birdconf::InfluxConfig;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

use super::{escape_tag, PublishSink};
use crate::error::SinkError;
use crate::protocol::{ClassificationEvent, Precision};

const NAME: &str = "influx";

pub struct InfluxSink {
    client: Client,
    write_url: Url,
    ping_url: Url,
    token: String,
    measurement: String,
    precision: Precision,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let precision = Precision::parse(&config.precision).ok_or_else(|| SinkError::Encode {
            sink: NAME,
            message: format!("unsupported precision {:?}", config.precision),
        })?;

        let base = config.url.trim_end_matches('/');
        let write_url = Url::parse_with_params(
            &format!("{base}/api/v2/write"),
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", precision.as_str()),
            ],
        )
        .map_err(|e| invalid_url(&config.url, e))?;
        let ping_url = Url::parse(&format!("{base}/ping")).map_err(|e| invalid_url(&config.url, e))?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(transport)?;

        Ok(Self {
            client,
            write_url,
            ping_url,
            token: config.token.clone(),
            measurement: config.measurement.clone(),
            precision,
        })
    }

    /// Line-protocol point for a classification.
    pub fn line(&self, event: &ClassificationEvent) -> Result<String, SinkError> {
        let timestamp = event
            .timestamp
            .epoch(self.precision)
            .ok_or_else(|| SinkError::Encode {
                sink: NAME,
                message: format!("unusable timestamp {}", event.timestamp),
            })?;
        if !event.confidence.is_finite() {
            return Err(SinkError::Encode {
                sink: NAME,
                message: format!("confidence is not finite: {}", event.confidence),
            });
        }

        // Empty tag values are rejected by the server.
        let mut point = escape_measurement(&self.measurement);
        for (key, value) in [("station", &event.station), ("label", &event.label)] {
            if !value.is_empty() {
                point.push_str(&format!(",{key}={}", escape_tag(value)));
            }
        }
        Ok(format!("{point} confidence={} {timestamp}", event.confidence))
    }
}

#[async_trait]
impl PublishSink for InfluxSink {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let resp = self
            .client
            .get(self.ping_url.clone())
            .send()
            .await
            .map_err(transport)?;
        check_status(resp).await
    }

    async fn publish(&self, event: &ClassificationEvent) -> Result<(), SinkError> {
        let body = self.line(event)?;
        debug!(%body, "writing point");

        let mut request = self.client.post(self.write_url.clone()).body(body);
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Token {}", self.token));
        }
        let resp = request.send().await.map_err(transport)?;
        check_status(resp).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<(), SinkError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());
    Err(SinkError::Status {
        sink: NAME,
        status: status.as_u16(),
        body,
    })
}

fn transport(e: reqwest::Error) -> SinkError {
    SinkError::Transport {
        sink: NAME,
        message: e.to_string(),
    }
}

fn invalid_url(url: &str, e: impl std::fmt::Display) -> SinkError {
    SinkError::Encode {
        sink: NAME,
        message: format!("invalid url {url:?}: {e}"),
    }
}

/// Measurements escape commas and spaces, but not `=`.
fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Timestamp;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn event() -> ClassificationEvent {
        ClassificationEvent {
            source_id: "source0".to_string(),
            station: "10.0.0.5".to_string(),
            label: "Turdus merula".to_string(),
            confidence: 0.92,
            timestamp: Timestamp::Epoch(1690000000000000000),
        }
    }

    #[test]
    fn test_line_protocol() {
        let sink = InfluxSink::new(&InfluxConfig::default()).unwrap();
        assert_eq!(
            sink.line(&event()).unwrap(),
            "birdedge,station=10.0.0.5,label=Turdus\\ merula confidence=0.92 1690000000000000000"
        );
    }

    #[test]
    fn test_line_omits_empty_station() {
        let sink = InfluxSink::new(&InfluxConfig::default()).unwrap();
        let mut event = event();
        event.station = String::new();
        assert_eq!(
            sink.line(&event).unwrap(),
            "birdedge,label=Turdus\\ merula confidence=0.92 1690000000000000000"
        );
    }

    #[test]
    fn test_line_converts_text_timestamp() {
        let config = InfluxConfig {
            precision: "s".to_string(),
            ..Default::default()
        };
        let sink = InfluxSink::new(&config).unwrap();
        let mut event = event();
        event.timestamp = Timestamp::Text("2023-07-22T04:26:40Z".to_string());
        assert!(sink.line(&event).unwrap().ends_with(" 1690000000"));

        event.timestamp = Timestamp::Text("yesterday".to_string());
        assert!(matches!(sink.line(&event), Err(SinkError::Encode { .. })));
    }

    #[test]
    fn test_rejects_unknown_precision() {
        let config = InfluxConfig {
            precision: "minutes".to_string(),
            ..Default::default()
        };
        assert!(InfluxSink::new(&config).is_err());
    }

    #[test]
    fn test_write_url() {
        let config = InfluxConfig {
            url: "http://influx:8086/".to_string(),
            ..Default::default()
        };
        let sink = InfluxSink::new(&config).unwrap();
        assert_eq!(
            sink.write_url.as_str(),
            "http://influx:8086/api/v2/write?org=default&bucket=radiotracking&precision=ns"
        );
        assert_eq!(sink.ping_url.as_str(), "http://influx:8086/ping");
    }

    #[tokio::test]
    async fn test_ping_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = InfluxConfig {
            url: format!("http://127.0.0.1:{port}"),
            timeout_ms: 1_000,
            ..Default::default()
        };
        let sink = InfluxSink::new(&config).unwrap();
        assert!(matches!(sink.ping().await, Err(SinkError::Transport { .. })));
    }

    /// Accept one request, reply with `status`, return the raw request text.
    async fn serve_once(listener: TcpListener, status: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        stream.write_all(reply.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&request).to_string()
    }

    #[tokio::test]
    async fn test_publish_posts_point_with_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "204 No Content"));

        let config = InfluxConfig {
            url: format!("http://127.0.0.1:{port}"),
            token: "s3cret".to_string(),
            ..Default::default()
        };
        let sink = InfluxSink::new(&config).unwrap();
        sink.publish(&event()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with(
            "POST /api/v2/write?org=default&bucket=radiotracking&precision=ns HTTP/1.1"
        ));
        assert!(request.to_ascii_lowercase().contains("authorization: token s3cret"));
        assert!(request.ends_with("confidence=0.92 1690000000000000000"));
    }

    #[tokio::test]
    async fn test_publish_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "401 Unauthorized"));

        let config = InfluxConfig {
            url: format!("http://127.0.0.1:{port}"),
            ..Default::default()
        };
        let sink = InfluxSink::new(&config).unwrap();
        let err = sink.publish(&event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Status { status: 401, .. }));
        server.await.unwrap();
    }
}
