//! Distributed deferred-task scheduling over RabbitMQ and Redis.
//!
//! A *deferred task* is a unit of work started on one process and executed,
//! possibly much later and on another process, by whichever scheduler node
//! has free capacity. Task records live in a shared [`TaskStore`]; every
//! state transition travels as a broker message, giving at-least-once
//! delivery through process crashes and restarts.
//!
//! The building blocks:
//!
//! - [`DeferredHandler`]: the user-supplied contract for one task kind
//! - [`HandlerRegistry`]: explicit table mapping class references to handlers
//! - [`TaskStore`]: durable record storage ([`RedisTaskStore`] in
//!   production, [`InMemoryTaskStore`] for tests)
//! - [`WorkerPool`]: bounded, cancellable execution slots per process
//! - [`DeferredScheduler`]: the orchestrator tying it all together
//!
//! # Examples
//!
//! ```no_run
//! use deferred_tasks::{
//!     DeferredScheduler, HandlerRegistry, RedisTaskStore, SchedulerConfig,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RedisTaskStore::new("redis://127.0.0.1/").await?);
//! let registry = Arc::new(HandlerRegistry::new());
//! // registry.register("reports.Export", Arc::new(...)).await;
//!
//! let scheduler = DeferredScheduler::new(
//!     SchedulerConfig::new("amqp://localhost:5672/%2f"),
//!     store,
//!     registry,
//!     HashMap::new(),
//! );
//! scheduler.setup().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod handler;
pub mod registry;
pub mod result;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker_pool;

pub use error::{StoreError, TaskError, TaskResult};
pub use handler::DeferredHandler;
pub use registry::HandlerRegistry;
pub use result::{ExecutionError, ExecutionResult};
pub use schedule::TaskSchedule;
pub use scheduler::{DeferredScheduler, SchedulerConfig};
pub use store::memory::InMemoryTaskStore;
pub use store::redis::RedisTaskStore;
pub use store::TaskStore;
pub use task::{
	ClassUniqueReference, DeferredContext, GlobalsContext, StartContext, TaskState, TaskUid,
	merge_contexts,
};
pub use worker_pool::WorkerPool;
