//! Cluster state subsystems.
//!
//! Each of these is plain single-owner state: the coordinator core owns one of
//! each and mutates them from its event loop, so none of them lock.
//!
//! - **NodeSupervisor**: worker lifecycle, pool sizing, TTL and drain timers
//! - **PlacementRing**: consistent-hash digest → node mapping
//! - **RpcChannel**: correlation of requests to acks, latency statistics
//! - **AllocationRegistry**: deployed-source cache and hosting confirmation

pub mod deployment;
pub mod node;
pub mod registry;
pub mod ring;
pub mod rpc;
pub mod supervisor;

pub use deployment::Deployment;
pub use node::{NodeInfo, NodeState, WorkerNode};
pub use registry::AllocationRegistry;
pub use ring::PlacementRing;
pub use rpc::{Delivery, RpcChannel, RpcStats};
pub use supervisor::{NodeSupervisor, TimerEvent};
