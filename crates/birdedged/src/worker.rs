//! Worker process management.
//!
//! A [`Launcher`] starts one worker generation and feeds its output into the
//! supervisor's event channel. Every generation produces some number of
//! [`WorkerEvent::Line`]s followed by exactly one [`WorkerEvent::Exited`];
//! lines are never delivered after the exit of their generation.

use birdconf::WorkerConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LaunchError;

/// How long output readers may keep running after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum WorkerEvent {
    /// One line of stdout or stderr, without the line terminator.
    Line { generation: u64, line: String },
    /// The process is gone. `status` is `None` if it could not be reaped.
    Exited {
        generation: u64,
        status: Option<ExitStatus>,
    },
}

/// Starts worker processes.
pub trait Launcher: Send {
    fn launch(
        &mut self,
        config_path: &Path,
        generation: u64,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerHandle, LaunchError>;
}

/// The supervisor's grip on a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    pub fn new(generation: u64, pid: Option<u32>, stop_tx: oneshot::Sender<()>) -> Self {
        Self {
            generation,
            pid,
            stop_tx: Some(stop_tx),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the worker to terminate. Returns false if a stop was already requested.
    pub fn stop(&mut self) -> bool {
        match self.stop_tx.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_tx.is_none()
    }
}

/// Runs the worker executable as `<executable> -c <config>`.
pub struct CommandLauncher {
    executable: PathBuf,
    env: BTreeMap<String, String>,
    stop_timeout: Duration,
}

impl CommandLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            env: config.env.clone(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

impl Launcher for CommandLauncher {
    fn launch(
        &mut self,
        config_path: &Path,
        generation: u64,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerHandle, LaunchError> {
        let mut command = Command::new(&self.executable);
        command
            .arg("-c")
            .arg(config_path)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            executable: self.executable.clone(),
            source,
        })?;
        let pid = child.id();
        info!(generation, pid, executable = %self.executable.display(), config = %config_path.display(), "worker started");

        let stdout = child.stdout.take().ok_or_else(|| LaunchError::MissingPipe {
            executable: self.executable.clone(),
            stream: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or_else(|| LaunchError::MissingPipe {
            executable: self.executable.clone(),
            stream: "stderr",
        })?;

        let readers = vec![
            tokio::spawn(forward_lines(stdout, generation, events.clone())),
            tokio::spawn(forward_lines(stderr, generation, events.clone())),
        ];

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(monitor(
            child,
            generation,
            stop_rx,
            self.stop_timeout,
            readers,
            events,
        ));

        Ok(WorkerHandle::new(generation, pid, stop_tx))
    }
}

async fn forward_lines<R>(stream: R, generation: u64, events: mpsc::Sender<WorkerEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(generation, error = %e, "worker output read failed");
                break;
            }
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        if events.send(WorkerEvent::Line { generation, line }).await.is_err() {
            break;
        }
    }
}

async fn monitor(
    mut child: Child,
    generation: u64,
    stop_rx: oneshot::Receiver<()>,
    stop_timeout: Duration,
    mut readers: Vec<JoinHandle<()>>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => terminate(&mut child, stop_timeout).await,
    };

    let status = match status {
        Ok(status) => {
            info!(generation, %status, "worker exited");
            Some(status)
        }
        Err(e) => {
            warn!(generation, error = %e, "failed to reap worker");
            None
        }
    };

    if tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(readers.iter_mut()))
        .await
        .is_err()
    {
        debug!(generation, "worker output still open after exit, abandoning readers");
        for reader in &readers {
            reader.abort();
        }
    }

    let _ = events.send(WorkerEvent::Exited { generation, status }).await;
}

/// SIGTERM, then SIGKILL once `stop_timeout` has passed.
async fn terminate(child: &mut Child, stop_timeout: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        if signal_terminate(pid) {
            match tokio::time::timeout(stop_timeout, child.wait()).await {
                Ok(status) => return status,
                Err(_) => warn!(pid, ?stop_timeout, "worker ignored SIGTERM, killing"),
            }
        }
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    // SAFETY: the pid belongs to our child, which has not been reaped yet.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> bool {
    false
}
