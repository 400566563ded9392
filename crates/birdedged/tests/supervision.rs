//! Supervisor driving a real worker process (a shell script speaking the
//! worker line protocol).

#![cfg(unix)]

use async_trait::async_trait;
use birdconf::WorkerConfig;
use birdedged::error::SinkError;
use birdedged::protocol::{ClassificationEvent, LogEvent};
use birdedged::{
    CommandLauncher, ConfigRenderer, IniDocument, OutputRouter, PublishSink, SourceRegistry,
    Supervisor, SupervisorSettings,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TEMPLATE: &str = "\
[application]
enable-perf-measurement=1

[source0]
enable=1
type=7
uri=http://10.0.0.5:8080/stream.wav
num-sources=1
gpu-id=1
latency=20

[streammux]
batch-size=1

[audio-classifier]
batch-size=1
";

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<ClassificationEvent>>,
    logs: Mutex<Vec<(Instant, LogEvent)>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.message.clone())
            .collect()
    }

    fn starts(&self) -> Vec<Instant> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.message.starts_with("starting"))
            .map(|(at, _)| *at)
            .collect()
    }
}

#[async_trait]
impl PublishSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn publish(&self, event: &ClassificationEvent) -> Result<(), SinkError> {
        self.published.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn publish_log(&self, event: &LogEvent) -> Result<(), SinkError> {
        self.logs.lock().unwrap().push((Instant::now(), event.clone()));
        Ok(())
    }
}

fn write_worker(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("birdedge");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn worker_config(executable: PathBuf) -> WorkerConfig {
    WorkerConfig {
        executable,
        restart_interval_secs: 1,
        discovery_grace_secs: 0,
        stop_timeout_secs: 2,
        env: BTreeMap::new(),
        ..Default::default()
    }
}

fn supervisor(
    dir: &TempDir,
    config: &WorkerConfig,
    sink: Arc<RecordingSink>,
) -> Supervisor<CommandLauncher> {
    let template = IniDocument::parse(TEMPLATE);
    let registry = SourceRegistry::from_sources(template.sources());
    Supervisor::new(
        registry,
        ConfigRenderer::new(template, dir.path().join("dynamic.conf")),
        OutputRouter::new(config.background_label.clone()),
        sink,
        CommandLauncher::new(config),
        SupervisorSettings::from(config),
    )
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_connection_error_reconfigures_worker() {
    let dir = TempDir::new().unwrap();
    let exe = write_worker(
        dir.path(),
        r#"trap 'echo "INFO: worker stopping"; exit 0' TERM
echo "starting"
if grep -q "^enable = 1" "$2"; then
  echo '{"label":"crow","confidence":0.92,"source_id":0,"timestamp":1690000000}'
  echo '{"label":"00_background","confidence":0.5,"source_id":0,"timestamp":1690000001}'
  echo "Could not connect, URL: 10.0.0.5:8080, reason: timeout" >&2
fi
while true; do sleep 0.1; done"#,
    );

    let config = worker_config(exe);
    let sink = Arc::new(RecordingSink::default());
    let mut supervisor = supervisor(&dir, &config, sink.clone());

    let (_discovery_tx, discovery_rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let result = supervisor.run(discovery_rx, token).await;
        (supervisor, result)
    });

    wait_for("second worker", || sink.starts().len() >= 2).await;
    // The reconfigured worker has nothing to complain about.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    shutdown.cancel();
    let (supervisor, result) = task.await.unwrap();
    result.unwrap();

    assert_eq!(supervisor.launches(), 2);
    assert!(!supervisor.registry().get("source0").unwrap().enabled);

    let published = sink.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].station, "10.0.0.5");
    assert_eq!(published[0].label, "crow");

    let messages = sink.messages();
    assert!(messages.contains(&"Could not connect, URL: 10.0.0.5:8080, reason: timeout".to_string()));
    assert_eq!(messages.last().map(String::as_str), Some("worker stopping"));

    let rendered = std::fs::read_to_string(dir.path().join("dynamic.conf")).unwrap();
    assert!(rendered.contains("[source0]\nenable = 0\n"));
    assert!(rendered.contains("[streammux]\nbatch-size = 0\n"));
}

#[tokio::test]
async fn test_crashing_worker_is_relaunched_at_most_once_per_interval() {
    let dir = TempDir::new().unwrap();
    let exe = write_worker(dir.path(), "echo starting\nexit 1");

    let config = worker_config(exe);
    let sink = Arc::new(RecordingSink::default());
    let mut supervisor = supervisor(&dir, &config, sink.clone());

    let (_discovery_tx, discovery_rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let result = supervisor.run(discovery_rx, token).await;
        (supervisor, result)
    });

    wait_for("three launches", || sink.starts().len() >= 3).await;
    shutdown.cancel();
    let (supervisor, result) = task.await.unwrap();
    result.unwrap();
    assert!(supervisor.launches() >= 3);

    let starts = sink.starts();
    for pair in starts.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_millis(900),
            "relaunched after {:?}",
            pair[1] - pair[0]
        );
    }
}

#[tokio::test]
async fn test_missing_worker_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = worker_config(dir.path().join("no-such-worker"));
    let mut supervisor = supervisor(&dir, &config, Arc::new(RecordingSink::default()));

    let (_discovery_tx, discovery_rx) = mpsc::channel(1);
    let err = supervisor
        .run(discovery_rx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("failed to launch worker"));
}
