//! Execution result types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Outcome of one execution attempt, produced exactly once per attempt by
/// the worker pool and persisted into the task record.
///
/// # Examples
///
/// ```rust
/// use deferred_tasks::ExecutionResult;
/// use serde_json::json;
///
/// let result = ExecutionResult::Success { value: json!(42) };
/// assert!(result.is_success());
/// assert!(!result.is_cancelled());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionResult {
	/// `run_deferred` returned normally.
	Success { value: serde_json::Value },
	/// `run_deferred` failed or the attempt timed out.
	Error(ExecutionError),
	/// The attempt was cooperatively cancelled.
	Cancelled,
}

impl ExecutionResult {
	/// True for the `Success` variant
	pub fn is_success(&self) -> bool {
		matches!(self, ExecutionResult::Success { .. })
	}

	/// True for the `Cancelled` variant
	pub fn is_cancelled(&self) -> bool {
		matches!(self, ExecutionResult::Cancelled)
	}
}

/// A captured execution failure: the error message plus the rendered error
/// chain, both persisted so the failure survives until retries are
/// exhausted and `on_finished_with_error` fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
	pub message: String,
	pub stack_trace: String,
}

impl ExecutionError {
	/// Capture an error raised from `run_deferred`
	pub fn from_error(error: &anyhow::Error) -> Self {
		Self {
			message: error.to_string(),
			// alternate Debug rendering includes the full cause chain
			stack_trace: format!("{:?}", error),
		}
	}

	/// Build the result of an expired execution timeout
	pub fn timed_out(timeout: Duration) -> Self {
		Self {
			message: format!("execution timed out after {:?}", timeout),
			stack_trace: String::new(),
		}
	}
}

impl fmt::Display for ExecutionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.stack_trace.is_empty() {
			write!(f, "{}", self.message)
		} else {
			write!(f, "{}\n{}", self.message, self.stack_trace)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::Context;
	use serde_json::json;

	#[test]
	fn test_result_round_trip() {
		let results = vec![
			ExecutionResult::Success {
				value: json!({"answer": 42}),
			},
			ExecutionResult::Error(ExecutionError {
				message: "boom".to_string(),
				stack_trace: "caused by: io".to_string(),
			}),
			ExecutionResult::Cancelled,
		];

		for result in results {
			let encoded = serde_json::to_string(&result).unwrap();
			let decoded: ExecutionResult = serde_json::from_str(&encoded).unwrap();
			assert_eq!(decoded, result);
		}
	}

	#[test]
	fn test_from_error_keeps_cause_chain() {
		let source = std::io::Error::other("disk on fire");
		let error = anyhow::Error::from(source).context("writing report failed");

		let captured = ExecutionError::from_error(&error);
		assert_eq!(captured.message, "writing report failed");
		assert!(captured.stack_trace.contains("disk on fire"));
	}

	#[test]
	fn test_timed_out_message() {
		let captured = ExecutionError::timed_out(Duration::from_secs(5));
		assert!(captured.message.contains("timed out"));
		assert!(captured.stack_trace.is_empty());
	}

	#[test]
	fn test_variant_predicates() {
		assert!(ExecutionResult::Success { value: json!(null) }.is_success());
		assert!(ExecutionResult::Cancelled.is_cancelled());
		assert!(
			!ExecutionResult::Error(ExecutionError::timed_out(Duration::from_secs(1)))
				.is_success()
		);
	}
}
