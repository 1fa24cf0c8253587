//! Worker node record and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spawn::WorkerHandle;
use crate::types::NodeId;

/// Worker lifecycle state.
///
/// State transitions:
/// ```text
/// UNWARMED → ONLINE → READY → DRAINING → DEAD
///     ↓         ↓        ↓
///    DEAD      DEAD     DEAD
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Forked, process not yet reported online.
    Unwarmed,
    /// Process is up; hooks and redeploys are running.
    Online,
    /// Serving traffic and on the ring.
    Ready,
    /// Off the ring, finishing in-flight work before exit.
    Draining,
    Dead,
}

impl NodeState {
    /// Still counted towards the pool but not yet serving.
    pub fn is_warming(self) -> bool {
        matches!(self, NodeState::Unwarmed | NodeState::Online)
    }

    /// Can still receive and answer messages.
    pub fn is_alive(self) -> bool {
        !matches!(self, NodeState::Dead)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: NodeState) -> bool {
        match (self, to) {
            (NodeState::Unwarmed, NodeState::Online) => true,
            (NodeState::Online, NodeState::Ready) => true,
            (NodeState::Online, NodeState::Draining) => true,
            (NodeState::Ready, NodeState::Draining) => true,
            (NodeState::Dead, _) => false,
            (_, NodeState::Dead) => true,
            _ => false,
        }
    }
}

/// A supervised worker: its process handle plus lifecycle bookkeeping.
#[derive(Debug)]
pub struct WorkerNode {
    pub id: NodeId,
    pub state: NodeState,
    pub created_at: DateTime<Utc>,
    pub ttl_deadline: Option<DateTime<Utc>>,
    pub(crate) handle: Box<dyn WorkerHandle>,
}

impl WorkerNode {
    pub fn new(id: NodeId, handle: Box<dyn WorkerHandle>) -> Self {
        Self {
            id,
            state: NodeState::Unwarmed,
            created_at: Utc::now(),
            ttl_deadline: None,
            handle,
        }
    }

    /// Move to `to` if the transition is legal. Returns whether it happened.
    pub fn transition(&mut self, to: NodeState) -> bool {
        if !self.state.can_transition_to(to) {
            tracing::debug!(
                "Ignoring node {} transition {:?} -> {:?}",
                self.id,
                self.state,
                to
            );
            return false;
        }
        self.state = to;
        true
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            state: self.state,
            created_at: self.created_at,
            ttl_deadline: self.ttl_deadline,
            pid: self.handle.pid(),
            hosted: 0,
        }
    }
}

/// External snapshot of a worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub state: NodeState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Digests confirmed deployed on this node.
    pub hosted: usize,
}
