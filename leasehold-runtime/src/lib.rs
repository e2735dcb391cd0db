//! # leasehold-runtime
//!
//! State machine engine for leasehold.
//!
//! This crate provides:
//! - Processors that lease a batch of entities in one state and apply a
//!   guarded transition function
//! - The manager loop that schedules processors with adaptive backoff
//! - Bounded same-state retry with an optional per-entity delay
//! - Command dispatch (registry, version-checked apply, async queue)
//! - Entity event broadcast, configuration and Prometheus metrics

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod manager;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod wait;

#[cfg(test)]
mod testing;

pub use command::{
    CommandHandler, CommandOutcome, CommandRegistry, EntityCommand, EntityCommandHandler,
};
pub use config::{Config, ConfigError, EngineConfig, MetricsConfig};
pub use error::{CommandError, ProcessError};
pub use events::{EntityEvent, EventBroadcaster, EventFilter, EventSubscription};
pub use guard::{transition, Guard, TransitionFn, TransitionFuture};
pub use manager::{StateMachineManager, StateMachineManagerBuilder};
pub use metrics::{run_metrics_server, Metrics};
pub use processor::{Processor, ProcessorBuilder};
pub use queue::CommandQueue;
pub use retry::{RetryOutcome, RetryPolicy};
pub use wait::{ExponentialWaitStrategy, FixedWaitStrategy, WaitStrategy};
