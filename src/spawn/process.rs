//! OS-process workers speaking the frame codec over stdin/stdout.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{WorkerEvents, WorkerHandle, WorkerSpawner};
use crate::protocol::codec::{read_message, write_message};
use crate::protocol::WorkerMessage;
use crate::types::{Config, Error, NodeId, Result};

/// Spawner launching `<program> <args> --ttl <ms> --max-frame-bytes <n>` per worker.
///
/// The child's stderr is inherited so worker logs land next to the
/// coordinator's. Children are killed when their handle is dropped.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    ttl: Duration,
    max_frame_bytes: u32,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ttl: Duration::from_secs(300),
            max_frame_bytes: 5 * 1024 * 1024,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.worker.program.clone(),
            args: config.worker.args.clone(),
            ttl: config.pool.node_ttl,
            max_frame_bytes: config.worker.max_frame_bytes,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

#[derive(Debug)]
struct ProcessHandle {
    pid: Option<u32>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    kill: CancellationToken,
}

impl WorkerHandle for ProcessHandle {
    fn send(&self, message: WorkerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::transport(format!("worker process {:?} stdin closed", self.pid)))
    }

    fn kill(&mut self) {
        self.kill.cancel();
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, node: NodeId, events: WorkerEvents) -> Result<Box<dyn WorkerHandle>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--ttl")
            .arg(self.ttl.as_millis().to_string())
            .arg("--max-frame-bytes")
            .arg(self.max_frame_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("worker stdin was not captured"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("worker stdout was not captured"))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let writer_node = node.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_message(&mut stdin, &message).await {
                    tracing::warn!("Write to worker {} failed: {}", writer_node, e);
                    break;
                }
            }
        });

        let reader_events = events.clone();
        let max_frame_bytes = self.max_frame_bytes;
        tokio::spawn(async move {
            loop {
                match read_message(&mut stdout, max_frame_bytes).await {
                    Ok(Some(message)) => reader_events.message(message),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Read from worker {} failed: {}", reader_events.node(), e);
                        break;
                    }
                }
            }
            reader_events.disconnected();
        });

        tracing::debug!("Spawned worker process {} (pid {:?})", node, pid);
        // The process being up with its pipes wired is the readiness handshake.
        events.online();

        let kill = CancellationToken::new();
        let token = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("Kill of worker {} failed: {}", events.node(), e);
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => events.exited(status.code(), exit_signal(&status)),
                Err(e) => {
                    tracing::warn!("Waiting on worker {} failed: {}", events.node(), e);
                    events.exited(None, None);
                }
            }
        });

        Ok(Box::new(ProcessHandle { pid, tx, kill }))
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
