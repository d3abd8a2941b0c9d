//! JobMesh Core - distributed job coordination kernel
//!
//! This crate provides the coordination layer for running one job across
//! many processes:
//! - Instance and server registration
//! - Leader election over a distributed lock
//! - Deterministic shard allocation
//! - Crash failover and misfire bookkeeping
//!
//! All state lives in a hierarchical coordination store behind
//! [`store::CoordinatorStore`]; [`store::MemoryStore`] is an in-process
//! implementation for tests and simulation.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod storage;
pub mod store;

pub use config::{CoordinatorSettings, JobConfig};
pub use coordinator::{JobCoordinator, JobInstance, ServerStatus, ShardingContext};
pub use error::{JobMeshError, Result};
pub use store::{CoordinatorStore, MemoryStore};
