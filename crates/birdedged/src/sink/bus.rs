//! ZMQ PUB message bus.
//!
//! Classifications go out as two-frame messages `[topic, record]` with the
//! topic `<prefix>/<hostname>` and the record
//! `timestamp<d>station<d>label<d>confidence`. Worker logs, when enabled,
//! use `<topic>/log` and `LEVEL<d>message`.

use async_trait::async_trait;
use birdconf::BusConfig;
use futures::{Sink, SinkExt};
use std::pin::Pin;
use tmq::Multipart;
use tokio::sync::Mutex;
use tracing::info;

use super::PublishSink;
use crate::error::SinkError;
use crate::protocol::{ClassificationEvent, LogEvent};

const NAME: &str = "bus";

type BoxedSink = Pin<Box<dyn Sink<Multipart, Error = tmq::TmqError> + Send>>;

pub struct BusSink {
    tx: Mutex<BoxedSink>,
    topic: String,
    log_topic: String,
    delimiter: String,
    publish_logs: bool,
}

impl BusSink {
    /// Bind the PUB socket, publishing under this machine's hostname.
    pub fn new(config: &BusConfig) -> Result<Self, SinkError> {
        let host = hostname::get().map_err(|e| SinkError::Transport {
            sink: NAME,
            message: format!("failed to read hostname: {e}"),
        })?;
        Self::bind(config, &host.to_string_lossy())
    }

    pub fn bind(config: &BusConfig, host: &str) -> Result<Self, SinkError> {
        let socket = tmq::publish(&tmq::Context::new())
            .set_linger(0)
            .bind(&config.endpoint)
            .map_err(|e| SinkError::Transport {
                sink: NAME,
                message: format!("failed to bind {}: {e}", config.endpoint),
            })?;
        info!(endpoint = %config.endpoint, "bus PUB socket bound");

        let topic = format!("{}/{}", config.topic_prefix, host);
        Ok(Self {
            tx: Mutex::new(Box::pin(socket)),
            log_topic: format!("{topic}/log"),
            topic,
            delimiter: config.delimiter.clone(),
            publish_logs: config.publish_logs,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn record(&self, event: &ClassificationEvent) -> String {
        [
            event.timestamp.to_string(),
            event.station.clone(),
            event.label.clone(),
            event.confidence.to_string(),
        ]
        .join(&self.delimiter)
    }

    async fn send(&self, topic: &str, record: String) -> Result<(), SinkError> {
        let frames: Multipart = vec![topic.as_bytes().to_vec(), record.into_bytes()].into();
        let mut tx = self.tx.lock().await;
        tx.send(frames).await.map_err(|e| SinkError::Transport {
            sink: NAME,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl PublishSink for BusSink {
    fn name(&self) -> &'static str {
        NAME
    }

    /// A bound PUB socket has no peer to check.
    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn publish(&self, event: &ClassificationEvent) -> Result<(), SinkError> {
        let record = self.record(event);
        self.send(&self.topic, record).await
    }

    async fn publish_log(&self, event: &LogEvent) -> Result<(), SinkError> {
        if !self.publish_logs {
            return Ok(());
        }
        let record = [event.level.as_str(), event.message.as_str()].join(&self.delimiter);
        self.send(&self.log_topic, record).await
    }

    async fn close(&self) {
        let mut tx = self.tx.lock().await;
        let _ = tx.close().await;
    }
}
