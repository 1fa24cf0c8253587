//! Unicast, anycast and broadcast on top of the core's request correlation.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::command::{Command, Dispatched, Target};
use super::Coordinator;
use crate::protocol::WorkerMessage;
use crate::types::{CorrelationId, Digest, Error, NodeId, Result};

/// One settled branch of a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acked {
    pub node: NodeId,
    pub id: CorrelationId,
    pub response: Value,
}

/// Wait for a dispatched request's ack.
///
/// There is no timeout: a request to a node that dies stays pending.
pub(crate) async fn settle(dispatched: Dispatched) -> Result<Value> {
    let Dispatched { node, id, ack } = dispatched;
    ack.await
        .map_err(|_| Error::internal(format!("request {} to {} was dropped", id, node)))?
}

impl Coordinator {
    /// Send `message` to one node and wait for its ack.
    pub async fn unicast(&self, node: &NodeId, message: WorkerMessage) -> Result<Value> {
        let dispatched = self
            .request(|reply| Command::Send {
                target: Target::Node(node.clone()),
                message,
                reply,
            })
            .await?;
        settle(dispatched).await
    }

    /// Send `message` to the node owning `digest` and wait for its ack.
    pub async fn anycast(&self, digest: &Digest, message: WorkerMessage) -> Result<Value> {
        let dispatched = self
            .request(|reply| Command::Send {
                target: Target::Owner(digest.clone()),
                message,
                reply,
            })
            .await?;
        settle(dispatched).await
    }

    /// Send `message` to every ring member, each under its own id, and wait
    /// until every branch settles. Failed branches don't stop the others; if
    /// any failed the whole call fails with `PartialBroadcast`.
    pub async fn broadcast(&self, message: WorkerMessage) -> Result<Vec<Acked>> {
        let branches = self
            .request(|reply| Command::Broadcast { message, reply })
            .await?;
        settle_all(branches).await
    }
}

/// Await every branch, then fold the outcomes.
pub(crate) async fn settle_all(branches: Vec<Result<Dispatched>>) -> Result<Vec<Acked>> {
    let total = branches.len();
    let outcomes = join_all(branches.into_iter().map(|branch| async move {
        let dispatched = branch?;
        let node = dispatched.node.clone();
        let id = dispatched.id.clone();
        let response = settle(dispatched).await?;
        Ok::<_, Error>(Acked { node, id, response })
    }))
    .await;

    let mut acked = Vec::with_capacity(total);
    let mut failed = 0;
    let mut first = None;
    for outcome in outcomes {
        match outcome {
            Ok(a) => acked.push(a),
            Err(e) => {
                failed += 1;
                first.get_or_insert_with(|| e.to_string());
            }
        }
    }

    match first {
        None => Ok(acked),
        Some(first) => {
            tracing::warn!("Broadcast failed on {} of {} nodes: {}", failed, total, first);
            Err(Error::PartialBroadcast {
                failed,
                total,
                first,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn dispatched(node: &str) -> (Dispatched, oneshot::Sender<Result<Value>>) {
        let (tx, ack) = oneshot::channel();
        (
            Dispatched {
                node: NodeId::from_string(node).unwrap(),
                id: CorrelationId::new(),
                ack,
            },
            tx,
        )
    }

    #[tokio::test]
    async fn test_settle_all_collects_every_branch() {
        let (a, tx_a) = dispatched("a");
        let (b, tx_b) = dispatched("b");
        tx_a.send(Ok(json!(1))).unwrap();
        tx_b.send(Ok(json!(2))).unwrap();

        let acked = settle_all(vec![Ok(a), Ok(b)]).await.unwrap();
        assert_eq!(acked.len(), 2);
        assert_ne!(acked[0].id, acked[1].id);
        assert_eq!(acked[1].response, json!(2));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_cancel_the_rest() {
        let (a, tx_a) = dispatched("a");
        let (b, tx_b) = dispatched("b");
        tx_a.send(Err(Error::worker("nope", Some(7)))).unwrap();

        // `b` settles only after `a` has failed.
        let pending = tokio::spawn(settle_all(vec![Ok(a), Ok(b), Err(Error::transport("closed"))]));
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        tx_b.send(Ok(json!("late"))).unwrap();

        match pending.await.unwrap() {
            Err(Error::PartialBroadcast { failed, total, .. }) => {
                assert_eq!(failed, 2);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_broadcast_succeeds() {
        assert!(settle_all(Vec::new()).await.unwrap().is_empty());
    }
}
