//! Persisted task schedule record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::result::ExecutionResult;
use crate::task::{ClassUniqueReference, StartContext, TaskState};

/// The persisted record of one deferred task, one per [`TaskUid`].
///
/// Created by the scheduler when a task is started, mutated only by the
/// scheduler's stage handlers, and removed once a terminal state's handler
/// has finished. Stores the *user* start context, never the merged one:
/// process-wide globals are re-merged on every access so a scheduler restart
/// with different globals is picked up transparently.
///
/// `result` is absent while the task is travelling towards execution and
/// present from the moment the worker stage completes an attempt.
///
/// [`TaskUid`]: crate::TaskUid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSchedule {
	/// Budget for one execution attempt; enforced by the worker pool.
	pub timeout: Duration,
	/// Which handler kind owns this task.
	pub class_unique_reference: ClassUniqueReference,
	/// Caller-supplied start parameters.
	pub start_context: StartContext,
	/// Current lifecycle state.
	pub state: TaskState,
	/// Remaining attempt budget. Starts at `get_retries + 1` and is
	/// decremented once per attempt when the submit stage runs.
	pub remaining_retries: u32,
	/// Creation timestamp, diagnostic only.
	pub time_started: DateTime<Utc>,
	/// Outcome of the latest execution attempt, if any.
	pub result: Option<ExecutionResult>,
	/// State the record held when cancellation was requested; lets the
	/// cancellation handler know whether an execution may be in flight.
	pub state_before_cancellation: Option<TaskState>,
}

impl TaskSchedule {
	/// Create a fresh record in the `Scheduled` state with a budget of
	/// `retries + 1` attempts.
	pub fn new(
		class_unique_reference: ClassUniqueReference,
		timeout: Duration,
		retries: u32,
		start_context: StartContext,
	) -> Self {
		Self {
			timeout,
			class_unique_reference,
			start_context,
			state: TaskState::Scheduled,
			remaining_retries: retries + 1,
			time_started: Utc::now(),
			result: None,
			state_before_cancellation: None,
		}
	}

	/// Wall-clock time since the record was created
	pub fn elapsed(&self) -> chrono::Duration {
		Utc::now() - self.time_started
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::result::ExecutionError;
	use serde_json::json;

	fn sample_schedule() -> TaskSchedule {
		let mut start_context = StartContext::new();
		start_context.insert("file".to_string(), json!("s3://bucket/key"));
		start_context.insert("attempts".to_string(), json!(3));

		TaskSchedule::new(
			ClassUniqueReference::from("reports.Export"),
			Duration::from_secs(30),
			2,
			start_context,
		)
	}

	#[test]
	fn test_new_schedule_invariants() {
		let schedule = sample_schedule();
		assert_eq!(schedule.state, TaskState::Scheduled);
		assert_eq!(schedule.remaining_retries, 3);
		assert!(schedule.result.is_none());
		assert!(schedule.state_before_cancellation.is_none());
	}

	#[test]
	fn test_round_trip_preserves_all_fields() {
		let mut schedule = sample_schedule();
		schedule.state = TaskState::ErrorResult;
		schedule.remaining_retries = 1;
		schedule.result = Some(ExecutionResult::Error(ExecutionError {
			message: "export failed".to_string(),
			stack_trace: "caused by: timeout".to_string(),
		}));

		let encoded = serde_json::to_string(&schedule).unwrap();
		let decoded: TaskSchedule = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded, schedule);
	}

	#[test]
	fn test_round_trip_with_cancellation_marker() {
		let mut schedule = sample_schedule();
		schedule.state_before_cancellation = Some(schedule.state);
		schedule.state = TaskState::ManuallyCancelled;

		let encoded = serde_json::to_string(&schedule).unwrap();
		let decoded: TaskSchedule = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded.state, TaskState::ManuallyCancelled);
		assert_eq!(decoded.state_before_cancellation, Some(TaskState::Scheduled));
	}

	#[test]
	fn test_elapsed_is_non_negative() {
		let schedule = sample_schedule();
		assert!(schedule.elapsed() >= chrono::Duration::zero());
	}
}
