//! Lifecycle hook bus.
//!
//! Collaborators plug into the coordinator at named extension points: deploy
//! authorization, dependency resolution, sandbox capability negotiation when a
//! node comes online, pipeline and route observation, cache invalidation.
//!
//! Per point, handlers form an insertion-ordered set (registering the same
//! handler twice is a no-op). A trigger runs the chain sequentially, awaiting
//! each handler before the next, and stops at the first failure, which then
//! aborts the operation that fired the hook.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cluster::Deployment;
use crate::coordinator::Coordinator;
use crate::pipeline::Step;
use crate::types::{Digest, Error, NodeId, Result};

// =============================================================================
// Hook Points
// =============================================================================

/// Named extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookPoint {
    #[serde(rename = "onDeploy")]
    Deploy,
    #[serde(rename = "onUndeploy")]
    Undeploy,
    #[serde(rename = "onNodeOnline")]
    NodeOnline,
    #[serde(rename = "onNodeReady")]
    NodeReady,
    #[serde(rename = "onInvoke")]
    Invoke,
    #[serde(rename = "onCreatePipeline")]
    CreatePipeline,
    #[serde(rename = "onInvokePipeline")]
    InvokePipeline,
    #[serde(rename = "onRollbackPipeline")]
    RollbackPipeline,
    #[serde(rename = "onRemovePipeline")]
    RemovePipeline,
    #[serde(rename = "onAssignRoute")]
    AssignRoute,
    #[serde(rename = "onRemoveRoute")]
    RemoveRoute,
    #[serde(rename = "onInvokeRoute")]
    InvokeRoute,
}

impl HookPoint {
    pub const ALL: [HookPoint; 12] = [
        HookPoint::Deploy,
        HookPoint::Undeploy,
        HookPoint::NodeOnline,
        HookPoint::NodeReady,
        HookPoint::Invoke,
        HookPoint::CreatePipeline,
        HookPoint::InvokePipeline,
        HookPoint::RollbackPipeline,
        HookPoint::RemovePipeline,
        HookPoint::AssignRoute,
        HookPoint::RemoveRoute,
        HookPoint::InvokeRoute,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::Deploy => "onDeploy",
            HookPoint::Undeploy => "onUndeploy",
            HookPoint::NodeOnline => "onNodeOnline",
            HookPoint::NodeReady => "onNodeReady",
            HookPoint::Invoke => "onInvoke",
            HookPoint::CreatePipeline => "onCreatePipeline",
            HookPoint::InvokePipeline => "onInvokePipeline",
            HookPoint::RollbackPipeline => "onRollbackPipeline",
            HookPoint::RemovePipeline => "onRemovePipeline",
            HookPoint::AssignRoute => "onAssignRoute",
            HookPoint::RemoveRoute => "onRemoveRoute",
            HookPoint::InvokeRoute => "onInvokeRoute",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a trigger. The coordinator is passed separately.
#[derive(Debug, Clone, Copy)]
pub enum HookEvent<'a> {
    Deploy(&'a Deployment),
    Undeploy(&'a Digest),
    NodeOnline(&'a NodeId),
    NodeReady(&'a NodeId),
    /// `allocated` tells whether the digest was already live on its owner.
    Invoke {
        digest: &'a Digest,
        context: &'a Value,
        allocated: bool,
    },
    CreatePipeline {
        name: &'a str,
        steps: &'a [Step],
    },
    InvokePipeline {
        name: &'a str,
        context: &'a Value,
    },
    RollbackPipeline {
        name: &'a str,
    },
    RemovePipeline {
        name: &'a str,
    },
    AssignRoute {
        route: &'a str,
        digest: &'a Digest,
    },
    RemoveRoute {
        route: &'a str,
    },
    InvokeRoute {
        route: &'a str,
        context: &'a Value,
    },
}

impl HookEvent<'_> {
    pub fn point(&self) -> HookPoint {
        match self {
            HookEvent::Deploy(_) => HookPoint::Deploy,
            HookEvent::Undeploy(_) => HookPoint::Undeploy,
            HookEvent::NodeOnline(_) => HookPoint::NodeOnline,
            HookEvent::NodeReady(_) => HookPoint::NodeReady,
            HookEvent::Invoke { .. } => HookPoint::Invoke,
            HookEvent::CreatePipeline { .. } => HookPoint::CreatePipeline,
            HookEvent::InvokePipeline { .. } => HookPoint::InvokePipeline,
            HookEvent::RollbackPipeline { .. } => HookPoint::RollbackPipeline,
            HookEvent::RemovePipeline { .. } => HookPoint::RemovePipeline,
            HookEvent::AssignRoute { .. } => HookPoint::AssignRoute,
            HookEvent::RemoveRoute { .. } => HookPoint::RemoveRoute,
            HookEvent::InvokeRoute { .. } => HookPoint::InvokeRoute,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// A lifecycle handler.
///
/// Returning an error rejects the operation that fired the hook. The
/// coordinator argument lets handlers call back into it (flush a cache,
/// deploy a dependency, inspect nodes).
#[async_trait]
pub trait LifecycleHook: Send + Sync + fmt::Debug {
    /// Points this handler subscribes to when registered with `use_hook`.
    fn hook_points(&self) -> Vec<HookPoint>;

    async fn handle(&self, event: &HookEvent<'_>, coordinator: &Coordinator) -> Result<()>;
}

type HookFnInner = dyn Fn(&HookEvent<'_>) -> Result<()> + Send + Sync;

/// Synchronous handler built from a closure.
#[derive(Clone)]
pub struct FnHook {
    points: Vec<HookPoint>,
    f: Arc<HookFnInner>,
}

impl FnHook {
    pub fn new<F>(points: impl IntoIterator<Item = HookPoint>, f: F) -> Self
    where
        F: Fn(&HookEvent<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            points: points.into_iter().collect(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHook").field("points", &self.points).finish()
    }
}

#[async_trait]
impl LifecycleHook for FnHook {
    fn hook_points(&self) -> Vec<HookPoint> {
        self.points.clone()
    }

    async fn handle(&self, event: &HookEvent<'_>, _coordinator: &Coordinator) -> Result<()> {
        (self.f)(event)
    }
}

/// Observer that logs every lifecycle event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHook;

#[async_trait]
impl LifecycleHook for LogHook {
    fn hook_points(&self) -> Vec<HookPoint> {
        HookPoint::ALL.to_vec()
    }

    async fn handle(&self, event: &HookEvent<'_>, _coordinator: &Coordinator) -> Result<()> {
        match event {
            HookEvent::Deploy(d) => tracing::info!("Deploying {} ({} bytes)", d.digest, d.source.len()),
            HookEvent::Undeploy(digest) => tracing::info!("Undeploying {}", digest),
            HookEvent::NodeOnline(node) => tracing::info!("Node {} online", node),
            HookEvent::NodeReady(node) => tracing::info!("Node {} ready", node),
            HookEvent::Invoke {
                digest, allocated, ..
            } => tracing::debug!("Invoking {} (allocated={})", digest, allocated),
            HookEvent::CreatePipeline { name, steps } => {
                tracing::info!("Pipeline {} pushed with {} steps", name, steps.len())
            }
            HookEvent::InvokePipeline { name, .. } => tracing::debug!("Invoking pipeline {}", name),
            HookEvent::RollbackPipeline { name } => tracing::info!("Pipeline {} rolled back", name),
            HookEvent::RemovePipeline { name } => tracing::info!("Pipeline {} removed", name),
            HookEvent::AssignRoute { route, digest } => {
                tracing::info!("Route {} -> {}", route, digest)
            }
            HookEvent::RemoveRoute { route } => tracing::info!("Route {} removed", route),
            HookEvent::InvokeRoute { route, .. } => tracing::debug!("Invoking route {}", route),
        }
        Ok(())
    }
}

// =============================================================================
// LifecycleHookBus
// =============================================================================

/// Trigger statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookStats {
    pub triggers: u64,
    pub handler_calls: u64,
    pub rejections: u64,
}

/// Ordered, de-duplicated handler chains per hook point.
///
/// Cheap to clone; clones share the same registrations.
#[derive(Debug, Clone, Default)]
pub struct LifecycleHookBus {
    handlers: Arc<RwLock<HashMap<HookPoint, Vec<Arc<dyn LifecycleHook>>>>>,
    stats: Arc<RwLock<HookStats>>,
}

fn same_handler(a: &Arc<dyn LifecycleHook>, b: &Arc<dyn LifecycleHook>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl LifecycleHookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to `point`'s chain. Returns false if it was already there.
    pub async fn register(&self, point: HookPoint, handler: Arc<dyn LifecycleHook>) -> bool {
        let mut handlers = self.handlers.write().await;
        let chain = handlers.entry(point).or_default();
        if chain.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        chain.push(handler);
        tracing::debug!("Registered {} handler #{}", point, chain.len());
        true
    }

    /// Register `handler` on every point it lists in `hook_points()`.
    pub async fn register_all(&self, handler: Arc<dyn LifecycleHook>) -> usize {
        let mut added = 0;
        for point in handler.hook_points() {
            if self.register(point, handler.clone()).await {
                added += 1;
            }
        }
        added
    }

    /// Remove `handler` from `point`'s chain.
    pub async fn unregister(&self, point: HookPoint, handler: &Arc<dyn LifecycleHook>) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(chain) = handlers.get_mut(&point) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|h| !same_handler(h, handler));
        before != chain.len()
    }

    pub async fn handler_count(&self, point: HookPoint) -> usize {
        self.handlers.read().await.get(&point).map_or(0, Vec::len)
    }

    /// Run `event`'s chain in registration order, stopping at the first failure.
    ///
    /// The chain is snapshotted first, so handlers may register or trigger
    /// hooks themselves without deadlocking.
    pub async fn trigger(&self, event: HookEvent<'_>, coordinator: &Coordinator) -> Result<()> {
        let point = event.point();
        let chain = self
            .handlers
            .read()
            .await
            .get(&point)
            .cloned()
            .unwrap_or_default();

        self.stats.write().await.triggers += 1;
        if chain.is_empty() {
            return Ok(());
        }

        for handler in chain {
            self.stats.write().await.handler_calls += 1;
            if let Err(e) = handler.handle(&event, coordinator).await {
                tracing::warn!("{} handler {:?} rejected: {}", point, handler, e);
                self.stats.write().await.rejections += 1;
                return Err(Error::hook_rejected(point.as_str(), e));
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> HookStats {
        self.stats.read().await.clone()
    }
}
