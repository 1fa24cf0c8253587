//! The coordinator: public API over the single-writer core.
//!
//! ```text
//!  Coordinator (Clone) ──Command──▶ CoordinatorCore ◀──WorkerEvent── workers
//!        │                           │  NodeSupervisor   PlacementRing
//!        │ awaits acks,              │  RpcChannel       AllocationRegistry
//!        │ runs hook chains          │  PipelineEngine   RouteTable
//!        ▼                           ◀──TimerEvent── TTL / drain timers
//!  LifecycleHookBus
//! ```
//!
//! Every mutation of routing state is a command processed by the core in
//! arrival order. Everything that waits happens on the handle, in the
//! caller's task, so in-flight requests never block the core.

mod command;
mod core;
mod dispatch;

pub use command::AllocationInfo;
pub use dispatch::Acked;

use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use self::command::{AllocationStatus, Command, Reply};
use self::core::{node_config, CoordinatorCore};
use self::dispatch::{settle, settle_all};
use crate::cluster::{
    AllocationRegistry, Deployment, NodeInfo, NodeSupervisor, PlacementRing, RpcChannel, RpcStats,
};
use crate::hooks::{HookEvent, HookPoint, LifecycleHook, LifecycleHookBus};
use crate::pipeline::{PipelineEngine, PipelineInfo, RouteEntry, RouteTable, Step};
use crate::protocol::WorkerMessage;
use crate::spawn::WorkerSpawner;
use crate::types::{Config, Digest, Error, NodeId, Result};

/// Handle to a running coordinator. Cheap to clone.
///
/// Lifecycle hooks receive one as their last argument.
#[derive(Debug, Clone)]
pub struct Coordinator {
    commands: mpsc::UnboundedSender<Command>,
    hooks: LifecycleHookBus,
    ready: watch::Receiver<usize>,
    cancel: CancellationToken,
    config: Arc<Config>,
}

/// Bring an invoke context into object shape: objects pass through, `null`
/// becomes `{}`, anything else is wrapped as `{"value": ...}`.
pub fn normalize_context(context: Value) -> Value {
    match context {
        Value::Object(_) => context,
        Value::Null => Value::Object(Map::new()),
        other => json!({ "value": other }),
    }
}

impl Coordinator {
    /// Start a coordinator on the current tokio runtime and begin forking
    /// workers up to `config.pool.max_nodes`.
    pub fn start(config: Config, spawner: Arc<dyn WorkerSpawner>) -> Result<Self> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(0);
        let cancel = CancellationToken::new();
        let config = Arc::new(config);

        let handle = Self {
            commands: commands_tx,
            hooks: LifecycleHookBus::new(),
            ready: ready_rx,
            cancel: cancel.clone(),
            config: config.clone(),
        };

        let pipelines = match config.pipeline.split_seed {
            Some(seed) => PipelineEngine::seeded(config.pipeline.resolution_cache_ttl, seed),
            None => PipelineEngine::new(config.pipeline.resolution_cache_ttl),
        };

        let core = CoordinatorCore {
            supervisor: NodeSupervisor::new(
                config.pool.max_nodes,
                config.pool.node_ttl,
                spawner,
                events_tx,
                timers_tx,
            ),
            ring: PlacementRing::new(config.pool.virtual_nodes),
            rpc: RpcChannel::new(),
            registry: AllocationRegistry::new(),
            pipelines,
            routes: RouteTable::new(),
            node_config: node_config(config.worker.module_path.as_deref()),
            handle: handle.clone(),
            ready: ready_tx,
            commands: commands_rx,
            events: events_rx,
            timers: timers_rx,
            cancel,
        };
        tokio::spawn(core.run());

        Ok(handle)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the core and kill every worker. Pending requests are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::internal("coordinator is stopped"))?;
        rx.await
            .map_err(|_| Error::internal("coordinator stopped before replying"))?
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Register `hook` on every point it lists. Returns how many were new.
    pub async fn use_hook(&self, hook: Arc<dyn LifecycleHook>) -> usize {
        self.hooks.register_all(hook).await
    }

    /// Register `hook` on a single point.
    pub async fn register_hook(&self, point: HookPoint, hook: Arc<dyn LifecycleHook>) -> bool {
        self.hooks.register(point, hook).await
    }

    pub fn hooks(&self) -> &LifecycleHookBus {
        &self.hooks
    }

    // =========================================================================
    // Deploy / invoke
    // =========================================================================

    /// Run `onDeploy`, cache the source, deploy it to the digest's owner and
    /// record the confirmation.
    ///
    /// With no node on the ring this fails with `NotFound`, but the source
    /// stays cached and is placed when a node comes online.
    pub async fn deploy(&self, deployment: Deployment) -> Result<Digest> {
        self.hooks.trigger(HookEvent::Deploy(&deployment), self).await?;

        let Deployment { digest, source, .. } = deployment;
        let dispatched = self
            .request(|reply| Command::Deploy {
                digest: digest.clone(),
                source,
                reply,
            })
            .await?;
        let node = dispatched.node.clone();
        settle(dispatched).await?;
        self.confirm_hosting(node, digest.clone()).await?;
        Ok(digest)
    }

    /// Deploy raw source under its content digest.
    pub async fn deploy_source(&self, source: impl Into<Bytes>) -> Result<Digest> {
        self.deploy(Deployment::new(source)).await
    }

    /// Run `onUndeploy`, drop the digest from the cache and hosting sets, and
    /// tell every node to unload it.
    ///
    /// Broadcast because earlier ring churn may have left copies on nodes
    /// that no longer own the digest.
    pub async fn undeploy(&self, digest: &Digest) -> Result<()> {
        self.hooks.trigger(HookEvent::Undeploy(digest), self).await?;
        let branches = self
            .request(|reply| Command::Undeploy {
                digest: digest.clone(),
                reply,
            })
            .await?;
        settle_all(branches).await?;
        Ok(())
    }

    async fn allocation_status(&self, digest: &Digest) -> Result<AllocationStatus> {
        self.request(|reply| Command::AllocationStatus {
            digest: digest.clone(),
            reply,
        })
        .await
    }

    async fn confirm_hosting(&self, node: NodeId, digest: Digest) -> Result<bool> {
        self.request(|reply| Command::ConfirmHosting {
            node,
            digest,
            reply,
        })
        .await
    }

    /// Cached, owned by a live node, and confirmed deployed there.
    pub async fn has_allocation(&self, digest: &Digest) -> Result<bool> {
        Ok(self.allocation_status(digest).await?.allocated)
    }

    /// Cached but not (yet) confirmed on its current owner, so a redeploy
    /// from cache is needed before invoking.
    pub async fn has_cached_allocation(&self, digest: &Digest) -> Result<bool> {
        let status = self.allocation_status(digest).await?;
        Ok(status.cached && !status.allocated)
    }

    /// Redeploy cached source to whichever node owns `digest` now.
    pub async fn allocate_from_cache(&self, digest: &Digest) -> Result<bool> {
        let dispatched = self
            .request(|reply| Command::RedeployFromCache {
                digest: digest.clone(),
                reply,
            })
            .await?;
        let node = dispatched.node.clone();
        settle(dispatched).await?;
        self.confirm_hosting(node, digest.clone()).await
    }

    /// Invoke a deployed function.
    ///
    /// Redeploys from cache first when the owner changed since the deploy,
    /// then runs `onInvoke` (which sees whether the digest was allocated and
    /// may deploy it itself), then anycasts the invocation.
    pub async fn invoke(&self, digest: &Digest, context: Value) -> Result<Value> {
        let context = normalize_context(context);

        let status = self.allocation_status(digest).await?;
        let mut allocated = status.allocated;
        if status.cached && !allocated {
            allocated = self.allocate_from_cache(digest).await?;
        }

        self.hooks
            .trigger(
                HookEvent::Invoke {
                    digest,
                    context: &context,
                    allocated,
                },
                self,
            )
            .await?;

        let dispatched = self
            .request(|reply| Command::Invoke {
                digest: digest.clone(),
                context,
                reply,
            })
            .await?;
        settle(dispatched).await
    }

    pub async fn list_deployments(&self) -> Result<Vec<AllocationInfo>> {
        self.request(|reply| Command::ListDeployments { reply }).await
    }

    /// Forget every cached source. Workers keep what they loaded.
    pub async fn flush_deployments(&self) -> Result<usize> {
        self.request(|reply| Command::FlushDeployments { reply }).await
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Push a new active version of `name`. Returns the version depth.
    pub async fn create_pipeline(&self, name: &str, steps: Vec<Step>) -> Result<usize> {
        PipelineEngine::validate(name, &steps)?;
        self.hooks
            .trigger(HookEvent::CreatePipeline { name, steps: &steps }, self)
            .await?;
        self.request(|reply| Command::PushPipeline {
            name: name.to_string(),
            steps,
            reply,
        })
        .await
    }

    /// Revert `name` to its previous version. Returns false if it had none.
    pub async fn rollback_pipeline(&self, name: &str) -> Result<bool> {
        self.hooks
            .trigger(HookEvent::RollbackPipeline { name }, self)
            .await?;
        self.request(|reply| Command::PopPipeline {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn remove_pipeline(&self, name: &str) -> Result<bool> {
        self.hooks
            .trigger(HookEvent::RemovePipeline { name }, self)
            .await?;
        self.request(|reply| Command::RemovePipeline {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Run the active version of `name`: each step's response is the next
    /// step's context; the last response is the result. Split steps that
    /// resolve to nothing are skipped.
    pub async fn invoke_pipeline(&self, name: &str, context: Value) -> Result<Value> {
        let mut value = normalize_context(context);
        self.hooks
            .trigger(
                HookEvent::InvokePipeline {
                    name,
                    context: &value,
                },
                self,
            )
            .await?;

        let digests = self
            .request(|reply| Command::ResolvePipeline {
                name: name.to_string(),
                reply,
            })
            .await?;
        for digest in &digests {
            value = self.invoke(digest, value).await?;
        }
        Ok(value)
    }

    /// Steps of the active version.
    pub async fn pipeline_steps(&self, name: &str) -> Result<Option<Vec<Step>>> {
        self.request(|reply| Command::PipelineSteps {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn list_pipelines(&self) -> Result<Vec<PipelineInfo>> {
        self.request(|reply| Command::ListPipelines { reply }).await
    }

    /// Drop every cached pipeline resolution.
    pub async fn flush_short_cache(&self) -> Result<()> {
        self.request(|reply| Command::FlushShortCache { reply }).await
    }

    // =========================================================================
    // Routes
    // =========================================================================

    /// Point `route` at `digest`. Returns the digest it replaced.
    pub async fn assign_route(&self, route: &str, digest: &Digest) -> Result<Option<Digest>> {
        if route.is_empty() {
            return Err(Error::validation("route cannot be empty"));
        }
        self.hooks
            .trigger(HookEvent::AssignRoute { route, digest }, self)
            .await?;
        self.request(|reply| Command::AssignRoute {
            route: route.to_string(),
            digest: digest.clone(),
            reply,
        })
        .await
    }

    pub async fn remove_route(&self, route: &str) -> Result<Option<Digest>> {
        self.hooks
            .trigger(HookEvent::RemoveRoute { route }, self)
            .await?;
        self.request(|reply| Command::RemoveRoute {
            route: route.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_route(&self, route: &str) -> Result<Option<Digest>> {
        self.request(|reply| Command::GetRoute {
            route: route.to_string(),
            reply,
        })
        .await
    }

    pub async fn list_routes(&self) -> Result<Vec<RouteEntry>> {
        self.request(|reply| Command::ListRoutes { reply }).await
    }

    /// Invoke whatever `route` points at.
    pub async fn invoke_route(&self, route: &str, context: Value) -> Result<Value> {
        self.hooks
            .trigger(
                HookEvent::InvokeRoute {
                    route,
                    context: &context,
                },
                self,
            )
            .await?;
        let digest = self
            .get_route(route)
            .await?
            .ok_or_else(|| Error::not_found(format!("route {}", route)))?;
        self.invoke(&digest, context).await
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Node-online sequence, run off the core: push node config, run
    /// `onNodeOnline`, join the ring, redeploy the cached allocations the node
    /// now owns, mark it ready (arming its TTL), run `onNodeReady`.
    pub(crate) async fn bring_online(
        &self,
        node: &NodeId,
        config: Option<Map<String, Value>>,
    ) -> Result<()> {
        if let Some(config) = config {
            let capabilities = self.unicast(node, WorkerMessage::set_config(config)).await?;
            tracing::debug!("Node {} capabilities: {}", node, capabilities);
        }

        self.hooks.trigger(HookEvent::NodeOnline(node), self).await?;

        let owned = self
            .request(|reply| Command::AdmitNode {
                node: node.clone(),
                reply,
            })
            .await?;
        let redeploys = owned.into_iter().map(|(digest, source)| async move {
            let result = self.unicast(node, WorkerMessage::deploy(digest.clone(), source)).await;
            match result {
                Ok(_) => self.confirm_hosting(node.clone(), digest).await.map(|_| ()),
                Err(e) => {
                    tracing::warn!("Redeploy of {} to {} failed: {}", digest, node, e);
                    Ok(())
                }
            }
        });
        for result in futures::future::join_all(redeploys).await {
            result?;
        }

        let ready = self
            .request(|reply| Command::MarkReady {
                node: node.clone(),
                reply,
            })
            .await?;
        if !ready {
            return Err(Error::not_found(format!("node {} left before becoming ready", node)));
        }
        tracing::info!("Node {} ready", node);

        if let Err(e) = self.hooks.trigger(HookEvent::NodeReady(node), self).await {
            tracing::warn!("onNodeReady failed for {}: {}", node, e);
        }
        Ok(())
    }

    pub async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        self.request(|reply| Command::Nodes { reply }).await
    }

    /// Node that currently owns `digest` on the ring.
    pub async fn owner_of(&self, digest: &Digest) -> Result<Option<NodeId>> {
        self.request(|reply| Command::OwnerOf {
            digest: digest.clone(),
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> Result<RpcStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Take `node` off the ring and terminate it. Its exit triggers a rebalance.
    pub async fn kill_node(&self, node: &NodeId) -> Result<bool> {
        self.request(|reply| Command::KillNode {
            node: node.clone(),
            reply,
        })
        .await
    }

    /// Take `node` off the ring, ask it to finish in-flight work, fork its
    /// replacement, and kill it if it is still around after `ttl`.
    pub async fn gracefully_kill_node(&self, node: &NodeId, ttl: Duration) -> Result<bool> {
        self.request(|reply| Command::DrainNode {
            node: node.clone(),
            ttl,
            reply,
        })
        .await
    }

    pub async fn ping(&self, node: &NodeId) -> Result<Value> {
        self.unicast(node, WorkerMessage::ping()).await
    }

    /// Ready nodes currently on the ring.
    pub fn ready_nodes(&self) -> usize {
        *self.ready.borrow()
    }

    /// Resolves once at least one node is ready.
    pub async fn wait_ready(&self) -> Result<()> {
        self.wait_for_nodes(1).await
    }

    /// Resolves once at least `count` nodes are ready at the same time.
    pub async fn wait_for_nodes(&self, count: usize) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|n| *n >= count)
            .await
            .map(|_| ())
            .map_err(|_| Error::internal("coordinator is stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeState;
    use crate::hooks::{FnHook, LogHook};
    use crate::spawn::LocalSpawner;
    use crate::worker::NativeSandbox;
    use tracing_test::traced_test;

    fn sandbox() -> NativeSandbox {
        NativeSandbox::new()
            .register("echo", |ctx| Ok(ctx))
            .register("double", |ctx| {
                let value = ctx["value"].as_i64().unwrap_or(0);
                Ok(json!({ "value": value * 2 }))
            })
    }

    fn config(nodes: usize) -> Config {
        let mut config = Config::default();
        config.pool.max_nodes = nodes;
        config.pool.node_ttl = Duration::ZERO;
        config.pool.virtual_nodes = 32;
        config
    }

    async fn start(nodes: usize) -> Coordinator {
        let coordinator =
            Coordinator::start(config(nodes), Arc::new(LocalSpawner::new(Arc::new(sandbox())))).unwrap();
        coordinator.wait_for_nodes(nodes).await.unwrap();
        coordinator
    }

    #[test]
    fn test_normalize_context() {
        assert_eq!(normalize_context(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(normalize_context(Value::Null), json!({}));
        assert_eq!(normalize_context(json!(3)), json!({"value": 3}));
        assert_eq!(normalize_context(json!([1, 2])), json!({"value": [1, 2]}));
    }

    #[tokio::test]
    async fn test_deploy_confirms_hosting_on_owner() {
        let c = start(3).await;
        let digest = c.deploy_source("double").await.unwrap();
        assert!(c.has_allocation(&digest).await.unwrap());
        assert!(!c.has_cached_allocation(&digest).await.unwrap());

        let owner = c.owner_of(&digest).await.unwrap().unwrap();
        let nodes = c.nodes().await.unwrap();
        let hosted: usize = nodes.iter().filter(|n| n.id == owner).map(|n| n.hosted).sum();
        assert_eq!(hosted, 1);
        assert!(nodes.iter().all(|n| n.state == NodeState::Ready));
        c.shutdown();
    }

    #[tokio::test]
    async fn test_invoke_unknown_digest_is_not_found() {
        let c = start(1).await;
        let err = c
            .invoke(&Digest::from_string("missing").unwrap(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(c.stats().await.unwrap().tracked_total, 0);
        c.shutdown();
    }

    #[tokio::test]
    async fn test_invoke_hook_can_reject() {
        let c = start(1).await;
        let digest = c.deploy_source("echo").await.unwrap();
        c.use_hook(Arc::new(FnHook::new([HookPoint::Invoke], |_| {
            Err(Error::validation("not today"))
        })))
        .await;

        match c.invoke(&digest, json!({})).await {
            Err(Error::HookRejected { hook, .. }) => assert_eq!(hook, "onInvoke"),
            other => panic!("unexpected {:?}", other),
        }
        c.shutdown();
    }

    #[tokio::test]
    async fn test_ping_and_stats() {
        let c = start(2).await;
        let node = c.nodes().await.unwrap()[0].id.clone();
        assert_eq!(c.ping(&node).await.unwrap(), json!({"pong": true}));
        let stats = c.stats().await.unwrap();
        assert_eq!(stats.tracked_total, 1);
        assert_eq!(stats.outstanding, 0);
        c.shutdown();
    }

    #[tokio::test]
    async fn test_killed_node_is_replaced() {
        let c = start(2).await;
        let victim = c.nodes().await.unwrap()[0].id.clone();
        assert!(c.kill_node(&victim).await.unwrap());

        for _ in 0..200 {
            let nodes = c.nodes().await.unwrap();
            if nodes.len() == 2 && nodes.iter().all(|n| n.id != victim && n.state == NodeState::Ready) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let nodes = c.nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.id != victim));
        c.shutdown();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_hook_sees_deploy() {
        let c = start(1).await;
        c.use_hook(Arc::new(LogHook)).await;
        let digest = c.deploy_source("echo").await.unwrap();
        assert!(logs_contain(&format!("Deploying {}", digest)));
        c.shutdown();
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let c = start(1).await;
        c.shutdown();
        assert!(c.is_shutdown());
        for _ in 0..50 {
            if c.nodes().await.is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("coordinator kept answering after shutdown");
    }
}
