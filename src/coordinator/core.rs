//! The coordinator core: single owner of all routing state.
//!
//! Handlers here never await. Anything that waits (acks, hook chains) runs on
//! a `Coordinator` handle in the caller's task and comes back as further
//! commands, so the ring, the allocation cache and the pipeline stacks are
//! only ever mutated from this loop.

use bytes::Bytes;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::command::{AllocationInfo, AllocationStatus, Command, Dispatched, Target};
use super::Coordinator;
use crate::cluster::{
    AllocationRegistry, NodeInfo, NodeState, NodeSupervisor, PlacementRing, RpcChannel,
    TimerEvent,
};
use crate::pipeline::{PipelineEngine, RouteTable};
use crate::protocol::WorkerMessage;
use crate::spawn::WorkerEvent;
use crate::types::{Digest, Error, NodeId, Result};
use crate::worker::MODULE_PATH_KEY;

/// Coordinator actor state.
#[derive(Debug)]
pub(crate) struct CoordinatorCore {
    pub(crate) supervisor: NodeSupervisor,
    pub(crate) ring: PlacementRing,
    pub(crate) rpc: RpcChannel,
    pub(crate) registry: AllocationRegistry,
    pub(crate) pipelines: PipelineEngine,
    pub(crate) routes: RouteTable,
    pub(crate) node_config: Option<Map<String, Value>>,
    pub(crate) handle: Coordinator,
    pub(crate) ready: watch::Sender<usize>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) events: mpsc::UnboundedReceiver<(NodeId, WorkerEvent)>,
    pub(crate) timers: mpsc::UnboundedReceiver<TimerEvent>,
    pub(crate) cancel: CancellationToken,
}

impl CoordinatorCore {
    /// Run until cancelled. Kills every worker on the way out.
    pub(crate) async fn run(mut self) {
        tracing::info!(
            "Coordinator started (target={} nodes, ttl={:?})",
            self.supervisor.target(),
            self.supervisor.ttl()
        );
        self.rebalance();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some((node, event)) = self.events.recv() => self.handle_worker_event(node, event),
                Some(timer) = self.timers.recv() => self.handle_timer(timer),
                Some(command) = self.commands.recv() => self.handle_command(command),
                else => break,
            }
        }

        self.supervisor.kill_all();
        tracing::info!("Coordinator stopped");
    }

    // =========================================================================
    // Worker events
    // =========================================================================

    fn handle_worker_event(&mut self, node: NodeId, event: WorkerEvent) {
        match event {
            WorkerEvent::Online => {
                if !self.supervisor.mark_online(&node) {
                    return;
                }
                tracing::debug!("Worker {} online", node);
                let handle = self.handle.clone();
                let config = self.node_config.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.bring_online(&node, config).await {
                        tracing::warn!("Node {} failed to come online: {}", node, e);
                        if let Err(e) = handle.kill_node(&node).await {
                            tracing::debug!("Could not kill node {}: {}", node, e);
                        }
                    }
                });
            }
            WorkerEvent::Message(message) => {
                self.rpc.handle_message(&node, message);
            }
            WorkerEvent::Exit { code, signal } => {
                if let Some(signal) = signal {
                    tracing::warn!("Node {} was killed by signal: {}", node, signal);
                } else if code.is_some_and(|c| c != 0) {
                    tracing::warn!("Node {} exited with error code: {:?}", node, code);
                } else {
                    tracing::info!("Node {} has finished execution", node);
                }
                self.remove_node(&node);
            }
            WorkerEvent::Disconnect => {
                tracing::debug!("Node {} disconnected", node);
                self.remove_node(&node);
            }
        }
    }

    fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::TtlExpired(node) => {
                if self.supervisor.is_ready(&node) {
                    tracing::info!("Node {} reached its TTL, recycling", node);
                    let ttl = self.supervisor.ttl();
                    self.drain(&node, ttl);
                }
            }
            TimerEvent::ForceKill(node) => {
                if self.supervisor.kill(&node) {
                    tracing::info!("Node {} outlived its drain window, killing", node);
                }
            }
        }
    }

    fn remove_node(&mut self, node: &NodeId) {
        self.ring.delete(node);
        self.registry.forget_node(node);
        if self.supervisor.remove(node).is_some() {
            self.publish_ready();
            self.rebalance();
        }
    }

    fn drain(&mut self, node: &NodeId, ttl: Duration) -> bool {
        self.ring.delete(node);
        let draining = self.supervisor.begin_drain(node, ttl);
        if draining {
            self.publish_ready();
            self.rebalance();
        }
        draining
    }

    /// Fork workers until the pool is back at its target.
    fn rebalance(&mut self) {
        let deficit = self.supervisor.deficit(&self.ring);
        for _ in 0..deficit {
            if let Err(e) = self.supervisor.fork() {
                tracing::error!("Failed to fork worker: {}", e);
                break;
            }
        }
    }

    fn publish_ready(&self) {
        self.ready.send_replace(self.supervisor.ready_count(&self.ring));
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver means the caller gave up; nothing to do.
        match command {
            Command::Send {
                target,
                message,
                reply,
            } => {
                let _ = reply.send(self.send_to(target, message));
            }
            Command::Broadcast { message, reply } => {
                let _ = reply.send(Ok(self.broadcast(&message)));
            }
            Command::Deploy {
                digest,
                source,
                reply,
            } => {
                self.registry.cache(digest.clone(), source.clone());
                let result = self
                    .send_to(Target::Owner(digest.clone()), WorkerMessage::deploy(digest, source));
                let _ = reply.send(result);
            }
            Command::RedeployFromCache { digest, reply } => {
                let _ = reply.send(self.redeploy_from_cache(digest));
            }
            Command::ConfirmHosting {
                node,
                digest,
                reply,
            } => {
                let live = self.registry.is_cached(&digest)
                    && self.supervisor.state(&node).is_some_and(NodeState::is_alive);
                if live {
                    self.registry.confirm(&node, &digest);
                }
                let _ = reply.send(Ok(live));
            }
            Command::AllocationStatus { digest, reply } => {
                let _ = reply.send(Ok(self.allocation_status(&digest)));
            }
            Command::Invoke {
                digest,
                context,
                reply,
            } => {
                let result = if self.registry.is_cached(&digest) {
                    self.send_to(Target::Owner(digest.clone()), WorkerMessage::invoke(digest, context))
                } else {
                    Err(Error::not_found(format!("digest {} is not deployed", digest)))
                };
                let _ = reply.send(result);
            }
            Command::Undeploy { digest, reply } => {
                self.registry.evict(&digest);
                let _ = reply.send(Ok(self.broadcast(&WorkerMessage::undeploy(digest))));
            }
            Command::ListDeployments { reply } => {
                let _ = reply.send(Ok(self.list_deployments()));
            }
            Command::FlushDeployments { reply } => {
                let flushed = self.registry.len();
                self.registry.flush();
                tracing::info!("Flushed {} cached deployments", flushed);
                let _ = reply.send(Ok(flushed));
            }

            Command::PushPipeline { name, steps, reply } => {
                let _ = reply.send(self.pipelines.push(&name, steps));
            }
            Command::PopPipeline { name, reply } => {
                let _ = reply.send(Ok(self.pipelines.pop(&name)));
            }
            Command::RemovePipeline { name, reply } => {
                let _ = reply.send(Ok(self.pipelines.remove(&name)));
            }
            Command::ResolvePipeline { name, reply } => {
                let _ = reply.send(self.pipelines.resolve(&name));
            }
            Command::PipelineSteps { name, reply } => {
                let _ = reply.send(Ok(self.pipelines.active(&name).map(<[_]>::to_vec)));
            }
            Command::ListPipelines { reply } => {
                let _ = reply.send(Ok(self.pipelines.list()));
            }
            Command::FlushShortCache { reply } => {
                self.pipelines.flush_cache();
                let _ = reply.send(Ok(()));
            }

            Command::AssignRoute {
                route,
                digest,
                reply,
            } => {
                let _ = reply.send(Ok(self.routes.assign(route, digest)));
            }
            Command::RemoveRoute { route, reply } => {
                let _ = reply.send(Ok(self.routes.remove(&route)));
            }
            Command::GetRoute { route, reply } => {
                let _ = reply.send(Ok(self.routes.get(&route).cloned()));
            }
            Command::ListRoutes { reply } => {
                let _ = reply.send(Ok(self.routes.list()));
            }

            Command::AdmitNode { node, reply } => {
                let _ = reply.send(self.admit(&node));
            }
            Command::MarkReady { node, reply } => {
                let ready = self.supervisor.mark_ready(&node);
                if ready {
                    self.publish_ready();
                    self.rebalance();
                }
                let _ = reply.send(Ok(ready));
            }
            Command::KillNode { node, reply } => {
                self.ring.delete(&node);
                let killed = self.supervisor.kill(&node);
                if killed {
                    self.publish_ready();
                }
                let _ = reply.send(Ok(killed));
            }
            Command::DrainNode { node, ttl, reply } => {
                let _ = reply.send(Ok(self.drain(&node, ttl)));
            }
            Command::Nodes { reply } => {
                let _ = reply.send(Ok(self.nodes()));
            }
            Command::OwnerOf { digest, reply } => {
                let _ = reply.send(Ok(self.ring.get(digest.as_str()).cloned()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.rpc.stats()));
            }
        }
    }

    // =========================================================================
    // Dispatch primitives
    // =========================================================================

    fn owner(&self, digest: &Digest) -> Result<NodeId> {
        self.ring
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no providers were found for {}", digest)))
    }

    /// Register a pending request and hand the message to the node's transport.
    fn dispatch(&mut self, node: &NodeId, mut message: WorkerMessage) -> Result<Dispatched> {
        let (id, ack) = self.rpc.register(&mut message)?;
        if let Err(e) = self.supervisor.send(node, message) {
            self.rpc.cancel(&id);
            return Err(e);
        }
        tracing::trace!("Dispatched {} to {}", id, node);
        Ok(Dispatched {
            node: node.clone(),
            id,
            ack,
        })
    }

    fn send_to(&mut self, target: Target, message: WorkerMessage) -> Result<Dispatched> {
        let node = match target {
            Target::Node(node) => node,
            Target::Owner(digest) => self.owner(&digest)?,
        };
        self.dispatch(&node, message)
    }

    /// One dispatch per ring member, each under a fresh id.
    fn broadcast(&mut self, message: &WorkerMessage) -> Vec<Result<Dispatched>> {
        let members: Vec<NodeId> = self.ring.members().cloned().collect();
        members
            .iter()
            .map(|node| {
                let mut copy = message.clone();
                copy.id = None;
                self.dispatch(node, copy)
            })
            .collect()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    fn allocation_status(&self, digest: &Digest) -> AllocationStatus {
        let cached = self.registry.is_cached(digest);
        let allocated = cached
            && self.ring.get(digest.as_str()).is_some_and(|owner| {
                self.supervisor.state(owner).is_some_and(NodeState::is_alive)
                    && self.registry.hosts(owner, digest)
            });
        AllocationStatus { cached, allocated }
    }

    fn redeploy_from_cache(&mut self, digest: Digest) -> Result<Dispatched> {
        let source = self
            .registry
            .source(&digest)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("digest {} is not cached", digest)))?;
        self.send_to(Target::Owner(digest.clone()), WorkerMessage::deploy(digest, source))
    }

    /// Put a node on the ring and hand back the cached allocations it now owns.
    fn admit(&mut self, node: &NodeId) -> Result<Vec<(Digest, Bytes)>> {
        if self.supervisor.state(node) != Some(NodeState::Online) {
            return Err(Error::not_found(format!("node {} is not coming online", node)));
        }
        self.ring.add(node);
        let owned = self.registry.owned_by(&self.ring, node);
        tracing::debug!("Node {} joined the ring owning {} cached allocations", node, owned.len());
        Ok(owned)
    }

    fn list_deployments(&self) -> Vec<AllocationInfo> {
        self.registry
            .digests()
            .into_iter()
            .map(|digest| {
                let status = self.allocation_status(&digest);
                AllocationInfo {
                    size: self.registry.source(&digest).map_or(0, Bytes::len),
                    owner: self.ring.get(digest.as_str()).cloned(),
                    allocated: status.allocated,
                    digest,
                }
            })
            .collect()
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        self.supervisor
            .infos()
            .into_iter()
            .map(|mut info| {
                info.hosted = self.registry.hosted_count(&info.id);
                info
            })
            .collect()
    }
}

/// Per-node config pushed with `SetConfig` before `onNodeOnline`.
pub(crate) fn node_config(module_path: Option<&str>) -> Option<Map<String, Value>> {
    module_path.map(|path| {
        let mut config = Map::new();
        config.insert(MODULE_PATH_KEY.to_string(), Value::String(path.to_string()));
        config
    })
}
