//! Error types for the deferred-task scheduler

use thiserror::Error;

use crate::task::ClassUniqueReference;

/// Errors returned by the public scheduler API.
///
/// Errors raised from inside a handler's `run_deferred` never surface here;
/// they are captured as an [`crate::ExecutionResult`] and routed through the
/// error-result stage instead.
#[derive(Debug, Error)]
pub enum TaskError {
	/// No handler was registered under the given reference.
	#[error("no handler registered for '{0}'")]
	UnknownHandler(ClassUniqueReference),

	/// The broker connection or a publish/consume operation failed.
	#[error("broker error: {0}")]
	Broker(#[from] lapin::Error),

	/// The task record store failed.
	#[error(transparent)]
	Store(#[from] StoreError),

	/// The scheduler was used before `setup` or after `shutdown`.
	#[error("scheduler is not connected to the broker")]
	NotConnected,

	/// A handler callback invoked on the caller path failed.
	#[error("handler callback failed: {0}")]
	Handler(anyhow::Error),
}

/// Result type for scheduler operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors raised by a [`crate::TaskStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
	/// The backing store could not be reached or rejected the operation.
	#[error("store backend error: {0}")]
	Backend(String),

	/// A persisted record could not be serialized or deserialized.
	#[error("schedule serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}
