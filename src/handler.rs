//! The handler contract: user-supplied callbacks describing one task kind

use async_trait::async_trait;
use std::time::Duration;

use crate::result::ExecutionError;
use crate::task::{DeferredContext, StartContext, TaskUid};

/// The user-supplied description of one deferred-task *kind*: its timeout,
/// retry budget and lifecycle callbacks. One implementation exists per kind,
/// registered in a [`HandlerRegistry`](crate::HandlerRegistry) under its
/// [`ClassUniqueReference`](crate::ClassUniqueReference).
///
/// Implementations hold no per-task state; every callback receives the
/// execution parameters it needs through the [`DeferredContext`].
///
/// The scheduler guarantees at-least-once delivery of state transitions, so
/// `run_deferred` must be written to tolerate a repeated attempt.
///
/// # Examples
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use deferred_tasks::{DeferredContext, DeferredHandler, StartContext, TaskUid};
/// use std::time::Duration;
///
/// struct ExportReport;
///
/// #[async_trait]
/// impl DeferredHandler for ExportReport {
///     async fn get_timeout(&self, _context: &DeferredContext) -> Duration {
///         Duration::from_secs(60)
///     }
///
///     async fn start_deferred(&self, args: StartContext) -> anyhow::Result<StartContext> {
///         Ok(args)
///     }
///
///     async fn run_deferred(
///         &self,
///         context: DeferredContext,
///     ) -> anyhow::Result<serde_json::Value> {
///         let target = context["target"].as_str().unwrap_or_default();
///         // ... produce the report ...
///         Ok(serde_json::json!({ "exported_to": target }))
///     }
///
///     async fn on_deferred_created(
///         &self,
///         task_uid: &TaskUid,
///         _context: &DeferredContext,
///     ) -> anyhow::Result<()> {
///         tracing::info!(%task_uid, "export scheduled");
///         Ok(())
///     }
///
///     async fn on_deferred_result(
///         &self,
///         value: serde_json::Value,
///         _context: DeferredContext,
///     ) -> anyhow::Result<()> {
///         tracing::info!(?value, "export finished");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait DeferredHandler: Send + Sync {
	/// Time budget for one execution attempt; expiry is reported as an
	/// error result and consumes a retry.
	async fn get_timeout(&self, context: &DeferredContext) -> Duration;

	/// Maximum number of *additional* attempts after the first failure.
	async fn get_retries(&self, _context: &DeferredContext) -> u32 {
		1
	}

	/// Compute the parameters to persist with the task record. Invoked
	/// once, on the caller path, before the task is ever queued; its return
	/// value becomes the record's start context.
	async fn start_deferred(&self, args: StartContext) -> anyhow::Result<StartContext>;

	/// The actual work. Executed inside the worker pool under the declared
	/// timeout; may fail. The returned value is persisted and later handed
	/// to [`on_deferred_result`](Self::on_deferred_result).
	async fn run_deferred(&self, context: DeferredContext) -> anyhow::Result<serde_json::Value>;

	/// Side-effecting hook fired right after the record is persisted and
	/// the first stage message published, still on the caller path.
	async fn on_deferred_created(
		&self,
		task_uid: &TaskUid,
		context: &DeferredContext,
	) -> anyhow::Result<()>;

	/// Fired after a successful execution, before the record is removed.
	async fn on_deferred_result(
		&self,
		value: serde_json::Value,
		context: DeferredContext,
	) -> anyhow::Result<()>;

	/// Fired when retries are exhausted with a genuine error. Never fired
	/// for a cancellation. Defaults to a no-op.
	async fn on_finished_with_error(
		&self,
		_error: &ExecutionError,
		_context: DeferredContext,
	) -> anyhow::Result<()> {
		Ok(())
	}
}
