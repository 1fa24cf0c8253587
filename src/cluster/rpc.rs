//! Request/ack correlation over worker messaging.
//!
//! Every outbound request gets a correlation id and a pending entry *before* it
//! is transmitted; the worker's `Ack` with the same id resolves that entry
//! exactly once. There is no timeout at this layer: a request whose worker dies
//! stays pending.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;

use crate::protocol::{MessageType, WorkerMessage};
use crate::types::{CorrelationId, Error, NodeId, Result};

/// Continuation for an outstanding request.
#[derive(Debug)]
struct PendingRequest {
    issued_at: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Resolved the pending request with this id.
    Resolved(CorrelationId),
    /// Ack for an id that is not (or no longer) outstanding.
    Stale(CorrelationId),
    /// Worker-side uncaught exception report.
    Uncaught,
    /// Lacked `type`/`id` or was not an ack.
    Ignored,
}

/// Running latency statistics over resolved requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcStats {
    /// Number of acks that resolved a request.
    pub tracked_total: u64,
    /// Sum of request round-trip times in nanoseconds.
    pub tracked_sum_ns: u128,
    /// Time since the channel was created, in nanoseconds.
    pub runtime_ns: u128,
    /// Round-trip time accumulated beyond wall-clock runtime (concurrency overlap).
    pub overtime_ns: i128,
    pub average_ns: u128,
    pub average_ms: u128,
    /// Requests still waiting for an ack.
    pub outstanding: usize,
}

/// Correlation table plus latency accounting.
///
/// NOT a separate actor - owned by the coordinator core and called via &mut self.
#[derive(Debug)]
pub struct RpcChannel {
    pending: HashMap<CorrelationId, PendingRequest>,
    started_at: Instant,
    tracked_total: u64,
    tracked_sum_ns: u128,
}

impl RpcChannel {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            started_at: Instant::now(),
            tracked_total: 0,
            tracked_sum_ns: 0,
        }
    }

    /// Assign a fresh id to `message` if it has none and register the pending
    /// continuation. Fails if a caller-supplied id is already outstanding.
    pub fn register(
        &mut self,
        message: &mut WorkerMessage,
    ) -> Result<(CorrelationId, oneshot::Receiver<Result<Value>>)> {
        let id = match &message.id {
            Some(id) if self.pending.contains_key(id) => {
                return Err(Error::validation(format!(
                    "correlation id {} is already outstanding",
                    id
                )));
            }
            Some(id) => id.clone(),
            None => {
                let mut id = CorrelationId::new();
                while self.pending.contains_key(&id) {
                    id = CorrelationId::new();
                }
                message.id = Some(id.clone());
                id
            }
        };

        let (reply, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                issued_at: Instant::now(),
                reply,
            },
        );
        Ok((id, rx))
    }

    /// Drop a pending entry whose message never left (transport failure).
    pub fn cancel(&mut self, id: &CorrelationId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Route an inbound worker message.
    pub fn handle_message(&mut self, node: &NodeId, message: WorkerMessage) -> Delivery {
        if message.kind.is_none() && message.id.is_none() {
            return Delivery::Ignored;
        }
        if message.kind == Some(MessageType::UncaughtException) {
            tracing::error!(
                "Uncaught exception on node {}: {}",
                node,
                message.error.as_deref().unwrap_or("<no detail>")
            );
            return Delivery::Uncaught;
        }
        if matches!(message.kind, Some(kind) if kind != MessageType::Ack) {
            return Delivery::Ignored;
        }
        let Some(id) = message.id.clone() else {
            return Delivery::Ignored;
        };

        let Some(pending) = self.pending.remove(&id) else {
            tracing::debug!("Dropping ack for unknown or resolved id {} from {}", id, node);
            return Delivery::Stale(id);
        };

        let elapsed = pending.issued_at.elapsed().as_nanos();
        self.tracked_total += 1;
        self.tracked_sum_ns += elapsed;

        // Receiver gone means the caller stopped waiting; the ack is still consumed.
        let _ = pending.reply.send(message.into_outcome());
        Delivery::Resolved(id)
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> RpcStats {
        let runtime_ns = self.started_at.elapsed().as_nanos();
        let average_ns = if self.tracked_total == 0 {
            0
        } else {
            self.tracked_sum_ns / u128::from(self.tracked_total)
        };
        RpcStats {
            tracked_total: self.tracked_total,
            tracked_sum_ns: self.tracked_sum_ns,
            runtime_ns,
            overtime_ns: self.tracked_sum_ns as i128 - runtime_ns as i128,
            average_ns,
            average_ms: average_ns / 1_000_000,
            outstanding: self.pending.len(),
        }
    }
}

impl Default for RpcChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Digest;
    use serde_json::json;

    fn node() -> NodeId {
        NodeId::from_string("n1").unwrap()
    }

    fn invoke() -> WorkerMessage {
        WorkerMessage::invoke(Digest::from_string("d1").unwrap(), json!({}))
    }

    #[tokio::test]
    async fn test_register_assigns_unique_ids() {
        let mut rpc = RpcChannel::new();
        let mut a = invoke();
        let mut b = invoke();
        let (id_a, _rx_a) = rpc.register(&mut a).unwrap();
        let (id_b, _rx_b) = rpc.register(&mut b).unwrap();

        assert_ne!(id_a, id_b);
        assert_eq!(a.id.as_ref(), Some(&id_a));
        assert_eq!(rpc.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_supplied_id_rejected() {
        let mut rpc = RpcChannel::new();
        let id = CorrelationId::from_string("fixed").unwrap();
        let mut first = invoke().with_id(id.clone());
        let mut second = invoke().with_id(id);
        let _rx = rpc.register(&mut first).unwrap();
        assert!(matches!(rpc.register(&mut second), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_ack_resolves_exactly_once() {
        let mut rpc = RpcChannel::new();
        let mut msg = invoke();
        let (id, rx) = rpc.register(&mut msg).unwrap();

        let ack = WorkerMessage::ack_ok(id.clone(), json!({"value": 4}));
        assert_eq!(rpc.handle_message(&node(), ack.clone()), Delivery::Resolved(id.clone()));
        assert_eq!(rpc.handle_message(&node(), ack), Delivery::Stale(id));

        assert_eq!(tokio_test::assert_ok!(rx.await.unwrap()), json!({"value": 4}));
        let stats = rpc.stats();
        assert_eq!(stats.tracked_total, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[tokio::test]
    async fn test_error_ack_rejects_with_code() {
        let mut rpc = RpcChannel::new();
        let mut msg = invoke();
        let (id, rx) = rpc.register(&mut msg).unwrap();

        rpc.handle_message(&node(), WorkerMessage::ack_err(id, "Digest was not found", Some(404)));
        let err = tokio_test::assert_err!(rx.await.unwrap());
        assert_eq!(err.worker_code(), Some(404));
    }

    #[test]
    fn test_malformed_messages_ignored() {
        let mut rpc = RpcChannel::new();
        assert_eq!(rpc.handle_message(&node(), WorkerMessage::default()), Delivery::Ignored);
        assert_eq!(rpc.handle_message(&node(), WorkerMessage::ping()), Delivery::Ignored);
        assert_eq!(
            rpc.handle_message(&node(), WorkerMessage::uncaught_exception("boom")),
            Delivery::Uncaught
        );
    }

    #[test]
    fn test_cancel_removes_pending() {
        let mut rpc = RpcChannel::new();
        let mut msg = invoke();
        let (id, _rx) = rpc.register(&mut msg).unwrap();
        assert!(rpc.is_pending(&id));
        assert!(rpc.cancel(&id));
        assert!(!rpc.is_pending(&id));
    }
}
