//! Messages from `Coordinator` handles to the core.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::cluster::{NodeInfo, RpcStats};
use crate::pipeline::{PipelineInfo, RouteEntry, Step};
use crate::protocol::WorkerMessage;
use crate::types::{CorrelationId, Digest, NodeId, Result};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Where a unicast goes.
#[derive(Debug, Clone)]
pub(crate) enum Target {
    Node(NodeId),
    /// Whichever node currently owns the digest on the ring.
    Owner(Digest),
}

/// A request that left the core: registered, handed to the transport, and
/// waiting for its ack.
#[derive(Debug)]
pub(crate) struct Dispatched {
    pub node: NodeId,
    pub id: CorrelationId,
    pub ack: oneshot::Receiver<Result<Value>>,
}

/// Allocation view of one digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AllocationStatus {
    pub cached: bool,
    /// Cached, owned by a live node, and confirmed deployed there.
    pub allocated: bool,
}

/// One cached deployment as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub digest: Digest,
    /// Source size in bytes.
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<NodeId>,
    pub allocated: bool,
}

#[derive(Debug)]
pub(crate) enum Command {
    // Dispatch
    Send {
        target: Target,
        message: WorkerMessage,
        reply: Reply<Dispatched>,
    },
    Broadcast {
        message: WorkerMessage,
        reply: Reply<Vec<Result<Dispatched>>>,
    },

    // Allocation
    Deploy {
        digest: Digest,
        source: Bytes,
        reply: Reply<Dispatched>,
    },
    RedeployFromCache {
        digest: Digest,
        reply: Reply<Dispatched>,
    },
    ConfirmHosting {
        node: NodeId,
        digest: Digest,
        reply: Reply<bool>,
    },
    AllocationStatus {
        digest: Digest,
        reply: Reply<AllocationStatus>,
    },
    Invoke {
        digest: Digest,
        context: Value,
        reply: Reply<Dispatched>,
    },
    Undeploy {
        digest: Digest,
        reply: Reply<Vec<Result<Dispatched>>>,
    },
    ListDeployments {
        reply: Reply<Vec<AllocationInfo>>,
    },
    FlushDeployments {
        reply: Reply<usize>,
    },

    // Pipelines
    PushPipeline {
        name: String,
        steps: Vec<Step>,
        reply: Reply<usize>,
    },
    PopPipeline {
        name: String,
        reply: Reply<bool>,
    },
    RemovePipeline {
        name: String,
        reply: Reply<bool>,
    },
    ResolvePipeline {
        name: String,
        reply: Reply<Vec<Digest>>,
    },
    PipelineSteps {
        name: String,
        reply: Reply<Option<Vec<Step>>>,
    },
    ListPipelines {
        reply: Reply<Vec<PipelineInfo>>,
    },
    FlushShortCache {
        reply: Reply<()>,
    },

    // Routes
    AssignRoute {
        route: String,
        digest: Digest,
        reply: Reply<Option<Digest>>,
    },
    RemoveRoute {
        route: String,
        reply: Reply<Option<Digest>>,
    },
    GetRoute {
        route: String,
        reply: Reply<Option<Digest>>,
    },
    ListRoutes {
        reply: Reply<Vec<RouteEntry>>,
    },

    // Nodes
    AdmitNode {
        node: NodeId,
        reply: Reply<Vec<(Digest, Bytes)>>,
    },
    MarkReady {
        node: NodeId,
        reply: Reply<bool>,
    },
    KillNode {
        node: NodeId,
        reply: Reply<bool>,
    },
    DrainNode {
        node: NodeId,
        ttl: Duration,
        reply: Reply<bool>,
    },
    Nodes {
        reply: Reply<Vec<NodeInfo>>,
    },
    OwnerOf {
        digest: Digest,
        reply: Reply<Option<NodeId>>,
    },
    Stats {
        reply: Reply<RpcStats>,
    },
}
