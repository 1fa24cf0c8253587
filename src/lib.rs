//! # Fabric Core - Function-Execution Fabric Coordinator
//!
//! Runs untrusted functions on a pool of isolated worker processes:
//! - Worker pool supervision with TTL-based recycling and graceful drain
//! - Consistent-hash placement of deployed functions onto workers
//! - Request/ack correlation over unicast, anycast and broadcast
//! - Deployed-source cache replayed onto new owners after ring churn
//! - Versioned pipelines with weighted split steps, and named routes
//! - Lifecycle hooks at every externally visible operation
//!
//! ## Architecture
//!
//! The coordinator follows a single-actor model where the core owns all mutable
//! state and `Coordinator` handles talk to it over a command channel:
//! ```text
//!                     ┌──────────────────────────────────┐
//!   Coordinator  →    │        Coordinator Core          │  ←  WorkerEvents
//!   (commands)        │  ┌──────────┐ ┌──────────────┐   │     (online, acks,
//!                     │  │Supervisor│ │PlacementRing │   │      exit)
//!                     │  └──────────┘ └──────────────┘   │
//!                     │  ┌──────────┐ ┌──────────────┐   │
//!                     │  │RpcChannel│ │  Allocation  │   │
//!                     │  │          │ │   Registry   │   │
//!                     │  └──────────┘ └──────────────┘   │
//!                     │  ┌──────────┐ ┌──────────────┐   │
//!                     │  │Pipelines │ │    Routes    │   │
//!                     │  └──────────┘ └──────────────┘   │
//!                     └──────────────────────────────────┘
//!                            │ WorkerSpawner / WorkerHandle
//!                            ▼
//!                     worker processes (WorkerRuntime + Sandbox)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod cluster;
pub mod coordinator;
pub mod hooks;
pub mod pipeline;
pub mod protocol;
pub mod spawn;
pub mod types;
pub mod worker;

// Internal utilities
pub mod observability;

pub use cluster::{Deployment, NodeInfo, NodeState, RpcStats};
pub use coordinator::{normalize_context, Acked, AllocationInfo, Coordinator};
pub use hooks::{FnHook, HookEvent, HookPoint, LifecycleHook, LifecycleHookBus, LogHook};
pub use pipeline::{PipelineInfo, RouteEntry, SplitStep, Step};
pub use protocol::WorkerMessage;
pub use spawn::{LocalSpawner, ProcessSpawner, WorkerSpawner};
pub use types::{Config, CorrelationId, Digest, Error, NodeId, Result};
pub use worker::{NativeSandbox, ScriptSandbox, WorkerRuntime};
