//! Telemetry sinks for worker events.
//!
//! Each transport implements [`PublishSink`]. The daemon picks the enabled
//! ones at startup and hands the supervisor a single [`FanoutSink`].
//!
//! Delivery is best effort: one publish call per event, no buffering and no
//! retries. Failures are returned to the caller, which logs and moves on.

mod bus;
mod influx;

pub use bus::BusSink;
pub use influx::InfluxSink;

use async_trait::async_trait;
use tracing::warn;

use crate::error::SinkError;
use crate::protocol::{ClassificationEvent, LogEvent};

#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Verify the transport is usable. Called once before the worker starts.
    async fn ping(&self) -> Result<(), SinkError>;

    async fn publish(&self, event: &ClassificationEvent) -> Result<(), SinkError>;

    /// Worker log lines, for sinks that keep an audit trail.
    async fn publish_log(&self, _event: &LogEvent) -> Result<(), SinkError> {
        Ok(())
    }

    /// Release connections. Called once during shutdown.
    async fn close(&self) {}
}

/// Publishes every event to each configured sink.
pub struct FanoutSink {
    sinks: Vec<Box<dyn PublishSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn PublishSink>>) -> Self {
        Self { sinks }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Keep the first failure for the caller, log the rest here.
    fn collect(results: Vec<(&'static str, Result<(), SinkError>)>) -> Result<(), SinkError> {
        let mut first = None;
        for (name, result) in results {
            if let Err(e) = result {
                if first.is_none() {
                    first = Some(e);
                } else {
                    warn!(sink = name, error = %e, "publish failed");
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl PublishSink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn ping(&self) -> Result<(), SinkError> {
        for sink in &self.sinks {
            sink.ping().await?;
        }
        Ok(())
    }

    async fn publish(&self, event: &ClassificationEvent) -> Result<(), SinkError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push((sink.name(), sink.publish(event).await));
        }
        Self::collect(results)
    }

    async fn publish_log(&self, event: &LogEvent) -> Result<(), SinkError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push((sink.name(), sink.publish_log(event).await));
        }
        Self::collect(results)
    }

    async fn close(&self) {
        for sink in &self.sinks {
            sink.close().await;
        }
    }
}

/// Escape a line-protocol tag key or value.
pub(crate) fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
