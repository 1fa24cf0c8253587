//! Worker side of the coordinator ↔ worker contract.
//!
//! A `WorkerRuntime` owns one worker's allocation table and answers every
//! id-bearing message with exactly one `Ack`. Loading and running deployed
//! source is delegated to a [`Sandbox`].

pub mod sandbox;

pub use sandbox::{Function, NativeSandbox, NodeConfig, Sandbox, ScriptSandbox, MODULE_PATH_KEY};

use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;

use crate::protocol::codec::{read_message, write_message};
use crate::protocol::{MessageType, WorkerMessage};
use crate::types::{Digest, Error, Result};

/// Error code reported when an invoke names a digest this worker doesn't host.
pub const NOT_FOUND_CODE: i64 = 404;

/// Per-worker allocation table plus message handling.
pub struct WorkerRuntime {
    sandbox: Arc<dyn Sandbox>,
    functions: RwLock<HashMap<Digest, Arc<dyn Function>>>,
    config: RwLock<NodeConfig>,
}

impl fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            functions: RwLock::new(HashMap::new()),
            config: RwLock::new(NodeConfig::default()),
        }
    }

    /// Number of functions currently loaded.
    pub async fn loaded(&self) -> usize {
        self.functions.read().await.len()
    }

    /// Handle one message. Returns the ack to send, if the message asked for one.
    ///
    /// `GracefulShutdown`, acks and unknown types produce nothing; the serving
    /// loop deals with shutdown itself.
    pub async fn handle(&self, message: WorkerMessage) -> Option<WorkerMessage> {
        let outcome = match message.kind? {
            MessageType::Deploy => self.deploy(&message).await,
            MessageType::Invoke => self.invoke(&message).await,
            MessageType::Undeploy => self.undeploy(&message).await,
            MessageType::SetConfig => self.set_config(&message).await,
            MessageType::Ping => Ok(json!({"pong": true})),
            MessageType::GracefulShutdown
            | MessageType::Ack
            | MessageType::UncaughtException
            | MessageType::Unknown => return None,
        };

        let id = message.id?;
        Some(match outcome {
            Ok(response) => WorkerMessage::ack_ok(id, response),
            Err(e) => {
                let (message, code) = match e {
                    Error::NotFound(message) => (message, Some(NOT_FOUND_CODE)),
                    Error::Worker { message, code } => (message, code),
                    other => (other.to_string(), None),
                };
                WorkerMessage::ack_err(id, message, code)
            }
        })
    }

    async fn deploy(&self, message: &WorkerMessage) -> Result<Value> {
        let (Some(digest), Some(source)) = (&message.digest, &message.source) else {
            return Err(Error::validation("Deploy requires digest and source"));
        };
        let function = {
            let config = self.config.read().await;
            self.sandbox.load(digest, source, &config)?
        };
        self.functions.write().await.insert(digest.clone(), function);
        tracing::debug!("Loaded {}", digest);
        Ok(json!({"digest": digest}))
    }

    async fn invoke(&self, message: &WorkerMessage) -> Result<Value> {
        let digest = message
            .digest
            .as_ref()
            .ok_or_else(|| Error::validation("Invoke requires a digest"))?;
        let function = self
            .functions
            .read()
            .await
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::not_found("Digest was not found"))?;
        function
            .call(message.context.clone().unwrap_or_else(|| json!({})))
            .await
    }

    async fn undeploy(&self, message: &WorkerMessage) -> Result<Value> {
        let digest = message
            .digest
            .as_ref()
            .ok_or_else(|| Error::validation("Undeploy requires a digest"))?;
        let removed = self.functions.write().await.remove(digest).is_some();
        Ok(json!({"removed": removed}))
    }

    async fn set_config(&self, message: &WorkerMessage) -> Result<Value> {
        let config = NodeConfig::new(message.config.clone().unwrap_or_default());
        let capabilities = config.capabilities();
        *self.config.write().await = config;
        Ok(json!({"capabilities": capabilities}))
    }

    /// Serve messages from `inbound` until it closes or a `GracefulShutdown`
    /// arrives, then wait for in-flight invocations to finish.
    ///
    /// Invocations run concurrently; every other message is handled in arrival
    /// order. A panicking function is reported as `UncaughtException` followed
    /// by an `ERROR` ack for its request.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<WorkerMessage>,
        outbound: mpsc::UnboundedSender<WorkerMessage>,
    ) {
        let mut inflight = JoinSet::new();

        while let Some(message) = inbound.recv().await {
            match message.kind {
                Some(MessageType::GracefulShutdown) => {
                    tracing::info!(
                        "Graceful shutdown requested (ttl={:?}ms), draining {} in-flight",
                        message.ttl,
                        inflight.len()
                    );
                    break;
                }
                Some(MessageType::Invoke) => {
                    let runtime = self.clone();
                    let outbound = outbound.clone();
                    inflight.spawn(async move {
                        let id = message.id.clone();
                        match AssertUnwindSafe(runtime.handle(message)).catch_unwind().await {
                            Ok(Some(ack)) => {
                                let _ = outbound.send(ack);
                            }
                            Ok(None) => {}
                            Err(panic) => {
                                let detail = panic_message(panic.as_ref());
                                tracing::error!("Function panicked: {}", detail);
                                let _ = outbound.send(WorkerMessage::uncaught_exception(detail.clone()));
                                if let Some(id) = id {
                                    let _ = outbound.send(WorkerMessage::ack_err(id, detail, None));
                                }
                            }
                        }
                    });
                }
                _ => {
                    if let Some(ack) = self.handle(message).await {
                        if outbound.send(ack).is_err() {
                            break;
                        }
                    }
                }
            }
            while inflight.try_join_next().is_some() {}
        }

        while inflight.join_next().await.is_some() {}
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}

/// Serve `runtime` over this process's stdin/stdout frame transport.
///
/// Returns after a graceful shutdown or when stdin closes.
pub async fn serve_stdio(runtime: Arc<WorkerRuntime>, max_frame_bytes: u32) -> std::io::Result<()> {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    let reader = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        loop {
            match read_message(&mut stdin, max_frame_bytes).await {
                Ok(Some(message)) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Worker transport read failed: {}", e);
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbound_rx.recv().await {
            write_message(&mut stdout, &message).await?;
        }
        Ok::<_, std::io::Error>(())
    });

    runtime.serve(inbound_rx, outbound_tx).await;
    reader.abort();

    writer
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}
