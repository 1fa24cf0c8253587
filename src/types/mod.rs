//! Core types for the fabric coordinator.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (NodeId, CorrelationId, Digest)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the pool, workers and pipelines

mod config;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig, PipelineConfig, PoolConfig, WorkerConfig};
pub use errors::{Error, Result};
pub use ids::{CorrelationId, Digest, NodeId};
