//! Worker process capability.
//!
//! The coordinator never touches OS processes directly. A [`WorkerSpawner`]
//! launches a worker and hands back a [`WorkerHandle`] for sending messages and
//! killing it; everything the worker does afterwards (coming online, replying,
//! exiting) arrives as a typed [`WorkerEvent`] on the channel behind
//! [`WorkerEvents`].

mod local;
mod process;

pub use local::LocalSpawner;
pub use process::ProcessSpawner;

use std::fmt;
use tokio::sync::mpsc;

use crate::protocol::WorkerMessage;
use crate::types::{NodeId, Result};

/// Something a worker did.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker is up and can receive messages.
    Online,
    /// A message arrived from the worker.
    Message(WorkerMessage),
    /// The worker exited. `signal` is set when it was terminated by one.
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The message channel closed.
    Disconnect,
}

/// Sink through which a spawned worker reports events, tagged with its node id.
#[derive(Debug, Clone)]
pub struct WorkerEvents {
    node: NodeId,
    tx: mpsc::UnboundedSender<(NodeId, WorkerEvent)>,
}

impl WorkerEvents {
    pub fn new(node: NodeId, tx: mpsc::UnboundedSender<(NodeId, WorkerEvent)>) -> Self {
        Self { node, tx }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    fn emit(&self, event: WorkerEvent) {
        // Receiver gone means the coordinator stopped; nobody is left to care.
        let _ = self.tx.send((self.node.clone(), event));
    }

    pub fn online(&self) {
        self.emit(WorkerEvent::Online);
    }

    pub fn message(&self, message: WorkerMessage) {
        self.emit(WorkerEvent::Message(message));
    }

    pub fn exited(&self, code: Option<i32>, signal: Option<i32>) {
        self.emit(WorkerEvent::Exit { code, signal });
    }

    pub fn disconnected(&self) {
        self.emit(WorkerEvent::Disconnect);
    }
}

/// Control side of one running worker.
pub trait WorkerHandle: Send + Sync + fmt::Debug {
    /// Hand a message to the worker's transport. Fails if the transport closed.
    fn send(&self, message: WorkerMessage) -> Result<()>;

    /// Terminate the worker. The exit is still reported through `WorkerEvents`.
    fn kill(&mut self);

    /// OS process id, when the worker is a process.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Launches workers.
pub trait WorkerSpawner: Send + Sync + fmt::Debug {
    fn spawn(&self, node: NodeId, events: WorkerEvents) -> Result<Box<dyn WorkerHandle>>;
}
