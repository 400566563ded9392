//! Worker supervisor.
//!
//! A single sequential loop owns the source registry, the rendered config
//! and the worker process. Discovery notifications, worker output, worker
//! exits and the restart timer are all inputs to that loop, so none of the
//! state is ever shared.
//!
//! Restarts are rate limited: two launches are always at least
//! `restart_interval` apart. A restart requested earlier is parked in a
//! single pending slot and carried out when the interval has passed. Before
//! the first launch the same slot holds the discovery grace deadline.

use anyhow::{Context, Result};
use birdconf::WorkerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::DiscoveryEvent;
use crate::protocol::{Event, LogEvent, LogLevel, OutputRouter};
use crate::registry::SourceRegistry;
use crate::render::ConfigRenderer;
use crate::sink::PublishSink;
use crate::worker::{Launcher, WorkerEvent, WorkerHandle};

/// Target under which worker log lines are re-emitted.
pub const WORKER_LOG_TARGET: &str = "birdedged::worker";

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Timing knobs of the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub restart_interval: Duration,
    pub discovery_grace: Duration,
}

impl From<&WorkerConfig> for SupervisorSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            restart_interval: config.restart_interval(),
            discovery_grace: config.discovery_grace(),
        }
    }
}

pub struct Supervisor<L: Launcher> {
    registry: SourceRegistry,
    renderer: ConfigRenderer,
    router: OutputRouter,
    sink: Arc<dyn PublishSink>,
    launcher: L,
    settings: SupervisorSettings,

    state: WorkerState,
    worker: Option<WorkerHandle>,
    generation: u64,
    launches: u64,
    last_launch: Option<Instant>,
    /// No launch before this instant, even if nothing ever ran.
    first_launch_at: Instant,
    pending_restart: Option<Instant>,
    shutting_down: bool,

    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(
        registry: SourceRegistry,
        renderer: ConfigRenderer,
        router: OutputRouter,
        sink: Arc<dyn PublishSink>,
        launcher: L,
        settings: SupervisorSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            registry,
            renderer,
            router,
            sink,
            launcher,
            settings,
            state: WorkerState::Stopped,
            worker: None,
            generation: 0,
            launches: 0,
            last_launch: None,
            first_launch_at: Instant::now() + settings.discovery_grace,
            pending_restart: None,
            shutting_down: false,
            events_tx,
            events_rx,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Number of worker processes started so far.
    pub fn launches(&self) -> u64 {
        self.launches
    }

    pub fn pending_restart(&self) -> Option<Instant> {
        self.pending_restart
    }

    /// Process events until `shutdown` is cancelled, then terminate the
    /// worker. Errors are fatal: the config could not be written or the
    /// worker could not be launched.
    pub async fn run(
        &mut self,
        mut discovery: mpsc::Receiver<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let result = self.event_loop(&mut discovery, &shutdown).await;
        self.terminate().await;
        self.sink.close().await;
        result
    }

    async fn event_loop(
        &mut self,
        discovery: &mut mpsc::Receiver<DiscoveryEvent>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        self.request_restart(Instant::now())?;
        let mut discovery_open = true;

        loop {
            let pending = self.pending_restart;
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_worker_event(event).await?;
                }

                event = discovery.recv(), if discovery_open => match event {
                    Some(event) => self.handle_discovery(event)?,
                    None => {
                        warn!("discovery channel closed");
                        discovery_open = false;
                    }
                },

                _ = sleep_until(pending.unwrap_or_else(Instant::now)), if pending.is_some() => {
                    self.pending_restart = None;
                    debug!("restart timer fired");
                    self.request_restart(Instant::now())?;
                }
            }
        }
    }

    /// Ask for the worker to be relaunched with the current registry.
    ///
    /// Launches (or stops the running worker, which relaunches on exit)
    /// right away if the rate limit allows it, otherwise parks the request
    /// in the pending slot.
    pub fn request_restart(&mut self, now: Instant) -> Result<()> {
        if self.shutting_down {
            debug!("ignoring restart request during shutdown");
            return Ok(());
        }

        let due = match self.last_launch {
            Some(at) => at + self.settings.restart_interval,
            None => self.first_launch_at,
        };

        if now < due {
            if self.pending_restart != Some(due) {
                debug!(in_ms = (due - now).as_millis() as u64, "restart deferred");
            }
            self.pending_restart = Some(due);
            return Ok(());
        }

        self.pending_restart = None;
        match self.worker.as_mut() {
            Some(worker) => {
                if worker.stop() {
                    info!(generation = worker.generation(), "stopping worker for restart");
                }
                self.state = WorkerState::Stopping;
                Ok(())
            }
            None => self.launch(now),
        }
    }

    fn launch(&mut self, now: Instant) -> Result<()> {
        self.state = WorkerState::Starting;

        let config_path = self
            .renderer
            .write(&self.registry)
            .context("failed to write worker config")?
            .to_path_buf();

        self.generation += 1;
        let handle = self
            .launcher
            .launch(&config_path, self.generation, self.events_tx.clone())
            .context("failed to launch worker")?;

        info!(
            generation = self.generation,
            pid = handle.pid(),
            active_sources = self.registry.active_count(),
            "worker running"
        );
        self.worker = Some(handle);
        self.last_launch = Some(now);
        self.launches += 1;
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Stop the worker for good. Pending restarts are dropped and nothing is
    /// launched afterwards. Output the worker prints while exiting is still
    /// routed.
    pub async fn terminate(&mut self) {
        self.shutting_down = true;
        self.pending_restart = None;

        if let Some(worker) = self.worker.as_mut() {
            worker.stop();
            self.state = WorkerState::Stopping;
            info!(generation = worker.generation(), "terminating worker");
        }

        while self.worker.is_some() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            if let Err(e) = self.handle_worker_event(event).await {
                error!(error = %e, "error while draining worker output");
            }
        }

        self.worker = None;
        self.state = WorkerState::Stopped;
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Line { line, .. } => self.handle_line(&line).await,
            WorkerEvent::Exited { generation, status } => {
                let Some(worker) = self.worker.take_if(|w| w.generation() == generation) else {
                    debug!(generation, "exit of a previous worker");
                    return Ok(());
                };
                if !worker.is_stopping() {
                    warn!(generation, ?status, "worker exited unexpectedly");
                }
                self.state = WorkerState::Stopped;
                self.request_restart(Instant::now())
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> Result<()> {
        for event in self.router.route(line, &self.registry) {
            match event {
                Event::Classification(event) => {
                    debug!(station = %event.station, label = %event.label, confidence = event.confidence, "classification");
                    if let Err(e) = self.sink.publish(&event).await {
                        warn!(error = %e, "dropping classification");
                    }
                }
                Event::Log(event) => {
                    emit_worker_log(&event);
                    if let Err(e) = self.sink.publish_log(&event).await {
                        warn!(error = %e, "dropping worker log");
                    }
                }
                Event::ConnectionError(event) => {
                    match self.registry.disable_by_uri(&event.uri) {
                        Some(id) => warn!(%id, uri = %event.uri, "source unreachable, disabled"),
                        None => warn!(uri = %event.uri, "unreachable uri matches no source"),
                    }
                    self.request_restart(Instant::now())?;
                }
            }
        }
        Ok(())
    }

    fn handle_discovery(&mut self, event: DiscoveryEvent) -> Result<()> {
        match event {
            DiscoveryEvent::Announced { name, host, port } => {
                let before = self.registry.snapshot().to_vec();
                let id = self.registry.upsert(&host, port);
                if self.registry.snapshot() == before.as_slice() {
                    debug!(%name, %id, "announcement changed nothing");
                    return Ok(());
                }
                info!(%name, %host, port, %id, "source enabled");
                self.request_restart(Instant::now())
            }
            DiscoveryEvent::Withdrawn { name, host } => match self.registry.disable(&host) {
                Some(id) => {
                    info!(%name, %host, %id, "source disabled");
                    self.request_restart(Instant::now())
                }
                None => Ok(()),
            },
        }
    }
}

fn emit_worker_log(event: &LogEvent) {
    match event.level {
        LogLevel::Info => info!(target: WORKER_LOG_TARGET, "{}", event.message),
        LogLevel::Warning => warn!(target: WORKER_LOG_TARGET, "{}", event.message),
        LogLevel::Error => error!(target: WORKER_LOG_TARGET, "{}", event.message),
    }
}
