//! Worker pool supervision.
//!
//! Tracks every forked worker through its lifecycle, computes how many workers
//! the pool is short of its target, and arms the per-node timers (TTL recycling
//! and forced kill after a drain window). Timers don't act on their own: they
//! report back as [`TimerEvent`]s so the owning core stays the single writer.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cluster::node::{NodeInfo, NodeState, WorkerNode};
use crate::cluster::ring::PlacementRing;
use crate::protocol::WorkerMessage;
use crate::spawn::{WorkerEvent, WorkerEvents, WorkerSpawner};
use crate::types::{Error, NodeId, Result};

/// A timer armed by the supervisor has fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The node reached the end of its lifetime and should be drained.
    TtlExpired(NodeId),
    /// The drain window closed; the node must be killed if still around.
    ForceKill(NodeId),
}

/// Worker pool bookkeeping.
///
/// NOT a separate actor - owned by the coordinator core and called via &mut self.
#[derive(Debug)]
pub struct NodeSupervisor {
    target: usize,
    ttl: Duration,
    spawner: Arc<dyn WorkerSpawner>,
    events: mpsc::UnboundedSender<(NodeId, WorkerEvent)>,
    timers: mpsc::UnboundedSender<TimerEvent>,
    nodes: HashMap<NodeId, WorkerNode>,
}

impl NodeSupervisor {
    pub fn new(
        target: usize,
        ttl: Duration,
        spawner: Arc<dyn WorkerSpawner>,
        events: mpsc::UnboundedSender<(NodeId, WorkerEvent)>,
        timers: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            target,
            ttl,
            spawner,
            events,
            timers,
            nodes: HashMap::new(),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Workers forked but not yet on the ring.
    pub fn warming_count(&self, ring: &PlacementRing) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state.is_warming() && !ring.contains(&n.id))
            .count()
    }

    /// How many workers to fork: target minus (ring members + warming workers).
    ///
    /// An admitted node stays `Online` until its redeploys settle; it is
    /// counted once, through the ring.
    pub fn deficit(&self, ring: &PlacementRing) -> usize {
        self.target
            .saturating_sub(ring.len() + self.warming_count(ring))
    }

    /// Launch one worker and start tracking it as `Unwarmed`.
    pub fn fork(&mut self) -> Result<NodeId> {
        let id = NodeId::new();
        let events = WorkerEvents::new(id.clone(), self.events.clone());
        let handle = self.spawner.spawn(id.clone(), events)?;
        tracing::debug!("Forked worker {}", id);
        self.nodes.insert(id.clone(), WorkerNode::new(id.clone(), handle));
        Ok(id)
    }

    /// The worker's process is up. Returns false for unknown or out-of-order nodes.
    pub fn mark_online(&mut self, id: &NodeId) -> bool {
        self.nodes
            .get_mut(id)
            .is_some_and(|node| node.transition(NodeState::Online))
    }

    /// The worker joined the ring and is serving. Arms its TTL timer.
    pub fn mark_ready(&mut self, id: &NodeId) -> bool {
        let ttl = self.ttl;
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if !node.transition(NodeState::Ready) {
            return false;
        }
        if !ttl.is_zero() {
            node.ttl_deadline = chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| Utc::now() + ttl);
            self.schedule(ttl, TimerEvent::TtlExpired(id.clone()));
        }
        true
    }

    /// Move a node to `Draining`: ask it to shut down and schedule a forced
    /// kill after `ttl`. A zero `ttl` kills it on the spot.
    ///
    /// The caller takes it off the ring. Returns false if the node is unknown
    /// or already draining.
    pub fn begin_drain(&mut self, id: &NodeId, ttl: Duration) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if !node.transition(NodeState::Draining) {
            return false;
        }
        if ttl.is_zero() {
            node.handle.kill();
            return true;
        }

        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        // Fire-and-forget; a node that can't take it gets killed when the window closes.
        if let Err(e) = node.handle.send(WorkerMessage::graceful_shutdown(ttl_ms)) {
            tracing::debug!("Shutdown request to {} not delivered: {}", id, e);
        }
        self.schedule(ttl, TimerEvent::ForceKill(id.clone()));
        true
    }

    /// Kill a node's worker. Its exit is reported through the event channel.
    pub fn kill(&mut self, id: &NodeId) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.handle.kill();
                true
            }
            None => false,
        }
    }

    /// Forget a node entirely (its worker exited or disconnected).
    pub fn remove(&mut self, id: &NodeId) -> Option<WorkerNode> {
        let mut node = self.nodes.remove(id)?;
        node.transition(NodeState::Dead);
        Some(node)
    }

    /// Hand a message to a node's transport.
    pub fn send(&self, id: &NodeId, message: WorkerMessage) -> Result<()> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| Error::not_found(format!("node {}", id)))?;
        if !node.state.is_alive() {
            return Err(Error::transport(format!("node {} is dead", id)));
        }
        node.handle.send(message)
    }

    pub fn get(&self, id: &NodeId) -> Option<&WorkerNode> {
        self.nodes.get(id)
    }

    pub fn state(&self, id: &NodeId) -> Option<NodeState> {
        self.nodes.get(id).map(|n| n.state)
    }

    pub fn is_ready(&self, id: &NodeId) -> bool {
        self.state(id) == Some(NodeState::Ready)
    }

    /// Ready nodes still on the ring. A killed node leaves the ring before
    /// its exit is reported.
    pub fn ready_count(&self, ring: &PlacementRing) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state == NodeState::Ready && ring.contains(&n.id))
            .count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn infos(&self) -> Vec<NodeInfo> {
        let mut infos: Vec<NodeInfo> = self.nodes.values().map(WorkerNode::info).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Kill every worker (coordinator shutdown).
    pub fn kill_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.handle.kill();
        }
    }

    fn schedule(&self, after: Duration, event: TimerEvent) {
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = timers.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::WorkerHandle;
    use std::sync::Mutex;

    /// Records what was sent to and done with each fake worker.
    #[derive(Debug, Default)]
    struct Recorder {
        sent: Mutex<Vec<(NodeId, WorkerMessage)>>,
        killed: Mutex<Vec<NodeId>>,
    }

    #[derive(Debug)]
    struct FakeHandle {
        id: NodeId,
        recorder: Arc<Recorder>,
    }

    impl WorkerHandle for FakeHandle {
        fn send(&self, message: WorkerMessage) -> Result<()> {
            self.recorder
                .sent
                .lock()
                .unwrap()
                .push((self.id.clone(), message));
            Ok(())
        }

        fn kill(&mut self) {
            self.recorder.killed.lock().unwrap().push(self.id.clone());
        }
    }

    #[derive(Debug, Default)]
    struct FakeSpawner {
        recorder: Arc<Recorder>,
    }

    impl WorkerSpawner for FakeSpawner {
        fn spawn(&self, node: NodeId, _events: WorkerEvents) -> Result<Box<dyn WorkerHandle>> {
            Ok(Box::new(FakeHandle {
                id: node,
                recorder: self.recorder.clone(),
            }))
        }
    }

    fn supervisor(
        target: usize,
        ttl: Duration,
    ) -> (NodeSupervisor, Arc<Recorder>, mpsc::UnboundedReceiver<TimerEvent>) {
        let spawner = FakeSpawner::default();
        let recorder = spawner.recorder.clone();
        let (events, _) = mpsc::unbounded_channel();
        let (timers, timer_rx) = mpsc::unbounded_channel();
        (
            NodeSupervisor::new(target, ttl, Arc::new(spawner), events, timers),
            recorder,
            timer_rx,
        )
    }

    #[tokio::test]
    async fn test_deficit_counts_warming_nodes() {
        let (mut sup, _, _) = supervisor(3, Duration::ZERO);
        let mut ring = PlacementRing::new(16);
        assert_eq!(sup.deficit(&ring), 3);

        let a = sup.fork().unwrap();
        sup.fork().unwrap();
        assert_eq!(sup.deficit(&ring), 1);

        sup.mark_online(&a);
        assert_eq!(sup.warming_count(&ring), 2);
        sup.mark_ready(&a);
        assert_eq!(sup.warming_count(&ring), 1);
        // `a` now counts through the ring instead.
        ring.add(&a);
        assert_eq!(sup.deficit(&ring), 1);

        for _ in 0..4 {
            ring.add(&NodeId::new());
        }
        assert_eq!(sup.deficit(&ring), 0);
    }

    #[tokio::test]
    async fn test_admitted_online_node_counted_once() {
        let (mut sup, _, _) = supervisor(2, Duration::ZERO);
        let mut ring = PlacementRing::new(16);
        let a = sup.fork().unwrap();
        let b = sup.fork().unwrap();
        for id in [&a, &b] {
            sup.mark_online(id);
            sup.mark_ready(id);
            ring.add(id);
        }

        // `b` left; its replacement is admitted but still warming up.
        ring.delete(&b);
        sup.remove(&b);
        let c = sup.fork().unwrap();
        sup.mark_online(&c);
        ring.add(&c);
        assert_eq!(sup.state(&c), Some(NodeState::Online));
        assert_eq!(sup.deficit(&ring), 0);

        // `a` leaves in that window: one fork is owed.
        ring.delete(&a);
        sup.remove(&a);
        assert_eq!(sup.warming_count(&ring), 0);
        assert_eq!(sup.deficit(&ring), 1);
    }

    #[tokio::test]
    async fn test_ready_requires_online_first() {
        let (mut sup, _, _) = supervisor(1, Duration::ZERO);
        let id = sup.fork().unwrap();
        assert!(!sup.mark_ready(&id));
        assert!(sup.mark_online(&id));
        assert!(sup.mark_ready(&id));
        assert!(sup.is_ready(&id));
        let mut ring = PlacementRing::new(16);
        assert_eq!(sup.ready_count(&ring), 0);
        ring.add(&id);
        assert_eq!(sup.ready_count(&ring), 1);
        assert!(sup.get(&id).unwrap().ttl_deadline.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_timer_fires_after_ready() {
        let (mut sup, _, mut timers) = supervisor(1, Duration::from_secs(30));
        let id = sup.fork().unwrap();
        sup.mark_online(&id);
        sup.mark_ready(&id);
        assert!(sup.get(&id).unwrap().ttl_deadline.is_some());

        assert_eq!(timers.recv().await, Some(TimerEvent::TtlExpired(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_requests_shutdown_then_force_kill() {
        let (mut sup, recorder, mut timers) = supervisor(1, Duration::ZERO);
        let id = sup.fork().unwrap();
        sup.mark_online(&id);
        sup.mark_ready(&id);

        assert!(sup.begin_drain(&id, Duration::from_millis(500)));
        assert!(!sup.begin_drain(&id, Duration::from_millis(500)));
        assert_eq!(sup.state(&id), Some(NodeState::Draining));

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, WorkerMessage::graceful_shutdown(500));
        assert!(sent[0].1.id.is_none());

        assert_eq!(timers.recv().await, Some(TimerEvent::ForceKill(id.clone())));
        assert!(sup.kill(&id));
        assert_eq!(recorder.killed.lock().unwrap().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn test_zero_ttl_drain_kills_immediately() {
        let (mut sup, recorder, _) = supervisor(1, Duration::ZERO);
        let id = sup.fork().unwrap();
        sup.mark_online(&id);
        assert!(sup.begin_drain(&id, Duration::ZERO));
        assert!(recorder.sent.lock().unwrap().is_empty());
        assert_eq!(recorder.killed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_send_to_unknown() {
        let (mut sup, _, _) = supervisor(1, Duration::ZERO);
        let id = sup.fork().unwrap();
        let removed = sup.remove(&id).unwrap();
        assert_eq!(removed.state, NodeState::Dead);
        assert!(sup.is_empty());
        assert!(matches!(
            sup.send(&id, WorkerMessage::ping()),
            Err(Error::NotFound(_))
        ));
    }
}
