//! In-process workers: each node is a tokio task running its own `WorkerRuntime`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{WorkerEvents, WorkerHandle, WorkerSpawner};
use crate::protocol::WorkerMessage;
use crate::types::{Error, NodeId, Result};
use crate::worker::{Sandbox, WorkerRuntime};

/// Signal number reported for a killed in-process worker.
const SIGTERM: i32 = 15;

/// Spawner running workers as tasks on the current runtime.
///
/// Every worker gets a fresh allocation table but shares the sandbox. Killing
/// aborts the task (reported as signal 15); a graceful shutdown drains
/// in-flight invocations and reports exit code 0.
#[derive(Debug)]
pub struct LocalSpawner {
    sandbox: Arc<dyn Sandbox>,
    spawned: AtomicUsize,
}

impl LocalSpawner {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            spawned: AtomicUsize::new(0),
        }
    }

    /// Total workers spawned so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct LocalHandle {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    kill: CancellationToken,
}

impl WorkerHandle for LocalHandle {
    fn send(&self, message: WorkerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::transport("worker channel closed"))
    }

    fn kill(&mut self) {
        self.kill.cancel();
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

impl WorkerSpawner for LocalSpawner {
    fn spawn(&self, node: NodeId, events: WorkerEvents) -> Result<Box<dyn WorkerHandle>> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();

        let runtime = Arc::new(WorkerRuntime::new(self.sandbox.clone()));
        let server = tokio::spawn(runtime.serve(inbound_rx, outbound_tx)).abort_handle();

        events.online();

        let token = kill.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        server.abort();
                        events.exited(None, Some(SIGTERM));
                        return;
                    }
                    message = outbound_rx.recv() => match message {
                        Some(message) => events.message(message),
                        // Every sender is gone: the runtime finished draining.
                        None => break,
                    },
                }
            }
            events.exited(Some(0), None);
        });

        let total = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("Spawned in-process worker {} ({} total)", node, total);

        Ok(Box::new(LocalHandle {
            tx: inbound_tx,
            kill,
        }))
    }
}
