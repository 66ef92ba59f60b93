//! Task identity and lifecycle state

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier of one deferred-task instance.
///
/// Minted by the task record store (see
/// [`TaskStore::mint_unique_id`](crate::TaskStore::mint_unique_id)), which
/// checks candidates against existing keys. Opaque to everything else; it is
/// the only data carried by stage messages.
///
/// # Example
///
/// ```rust
/// use deferred_tasks::TaskUid;
///
/// let uid = TaskUid::from("019524b0a44a");
/// assert_eq!(uid.as_str(), "019524b0a44a");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskUid(String);

impl TaskUid {
	/// View the identifier as a string slice
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<String> for TaskUid {
	fn from(value: String) -> Self {
		Self(value)
	}
}

impl From<&str> for TaskUid {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl fmt::Display for TaskUid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Stable identifier of a handler *kind*, shared by all task instances of
/// that kind. Used to look up the registered
/// [`DeferredHandler`](crate::DeferredHandler) for a persisted record, so it
/// must stay stable across process restarts and deployments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassUniqueReference(String);

impl ClassUniqueReference {
	/// View the reference as a string slice
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<String> for ClassUniqueReference {
	fn from(value: String) -> Self {
		Self(value)
	}
}

impl From<&str> for ClassUniqueReference {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl fmt::Display for ClassUniqueReference {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Lifecycle state of a deferred task.
///
/// Single linear progression with one retry loop
/// (`ErrorResult -> SubmitTask`) and one externally-triggered branch: any
/// state may move to `ManuallyCancelled` on request. Serialized as
/// SCREAMING_SNAKE_CASE strings so records written before a process restart
/// stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
	Scheduled,
	SubmitTask,
	Worker,
	ErrorResult,
	FinishedWithError,
	DeferredResult,
	ManuallyCancelled,
}

impl fmt::Display for TaskState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			TaskState::Scheduled => "SCHEDULED",
			TaskState::SubmitTask => "SUBMIT_TASK",
			TaskState::Worker => "WORKER",
			TaskState::ErrorResult => "ERROR_RESULT",
			TaskState::FinishedWithError => "FINISHED_WITH_ERROR",
			TaskState::DeferredResult => "DEFERRED_RESULT",
			TaskState::ManuallyCancelled => "MANUALLY_CANCELLED",
		};
		write!(f, "{}", name)
	}
}

/// Opaque start parameters supplied by the caller of `start_deferred` and
/// persisted with the task record.
pub type StartContext = HashMap<String, serde_json::Value>;

/// Process-wide context supplied once at scheduler construction. Not
/// persisted: a restart with different globals is picked up transparently.
pub type GlobalsContext = HashMap<String, serde_json::Value>;

/// [`StartContext`] merged over the [`GlobalsContext`]; what every handler
/// callback receives as execution parameters.
pub type DeferredContext = HashMap<String, serde_json::Value>;

/// Merge global and start contexts, start keys winning on collision.
pub fn merge_contexts(globals: &GlobalsContext, start: &StartContext) -> DeferredContext {
	let mut merged = globals.clone();
	merged.extend(start.iter().map(|(k, v)| (k.clone(), v.clone())));
	merged
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_task_state_wire_names() {
		let encoded = serde_json::to_string(&TaskState::SubmitTask).unwrap();
		assert_eq!(encoded, r#""SUBMIT_TASK""#);

		let decoded: TaskState = serde_json::from_str(r#""MANUALLY_CANCELLED""#).unwrap();
		assert_eq!(decoded, TaskState::ManuallyCancelled);
	}

	#[rstest::rstest]
	#[case(TaskState::Scheduled, "SCHEDULED")]
	#[case(TaskState::SubmitTask, "SUBMIT_TASK")]
	#[case(TaskState::Worker, "WORKER")]
	#[case(TaskState::ErrorResult, "ERROR_RESULT")]
	#[case(TaskState::FinishedWithError, "FINISHED_WITH_ERROR")]
	#[case(TaskState::DeferredResult, "DEFERRED_RESULT")]
	#[case(TaskState::ManuallyCancelled, "MANUALLY_CANCELLED")]
	fn test_task_state_display_matches_wire_name(#[case] state: TaskState, #[case] name: &str) {
		assert_eq!(state.to_string(), name);
		assert_eq!(serde_json::to_string(&state).unwrap(), format!("\"{name}\""));
	}

	#[test]
	fn test_merge_contexts_start_wins() {
		let mut globals = GlobalsContext::new();
		globals.insert("shared".to_string(), json!("from-globals"));
		globals.insert("global_only".to_string(), json!(1));

		let mut start = StartContext::new();
		start.insert("shared".to_string(), json!("from-start"));
		start.insert("start_only".to_string(), json!(2));

		let merged = merge_contexts(&globals, &start);
		assert_eq!(merged["shared"], json!("from-start"));
		assert_eq!(merged["global_only"], json!(1));
		assert_eq!(merged["start_only"], json!(2));
	}

	#[test]
	fn test_task_uid_transparent_serde() {
		let uid = TaskUid::from("abc-123");
		let encoded = serde_json::to_string(&uid).unwrap();
		assert_eq!(encoded, r#""abc-123""#);
	}
}
