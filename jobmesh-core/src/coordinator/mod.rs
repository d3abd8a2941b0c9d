//! Job coordination kernel
//!
//! Instance and server registration, leader election, shard assignment,
//! execution tracking and crash failover for one job, all driven by change
//! events from the coordination store.

pub mod config_service;
pub mod context;
pub mod execution;
pub mod failover;
pub mod instance;
pub mod job;
pub mod leader;
pub mod listener;
pub mod listeners;
pub mod reconcile;
pub mod server;
pub mod shard_assigner;
pub mod sharding;

pub use config_service::ConfigService;
pub use context::JobContext;
pub use execution::ExecutionService;
pub use failover::{FailoverService, FailoverTrigger};
pub use instance::{InstanceService, JobInstance};
pub use job::{JobCoordinator, ShardingContext};
pub use leader::LeaderService;
pub use listener::ListenerManager;
pub use server::{ServerService, ServerStatus};
pub use shard_assigner::{Assignment, ShardingStrategy, StrategyRegistry};
pub use sharding::ShardingService;
