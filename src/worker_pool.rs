//! Bounded execution pool for deferred task runs

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::DeferredHandler;
use crate::result::{ExecutionError, ExecutionResult};
use crate::task::{DeferredContext, TaskUid};

/// Tracking entry for one task uid. At-least-once delivery can race two
/// runs of the same uid through the pool; they share one token so that a
/// cancel reaches every attempt and an attempt finishing first cannot
/// untrack the survivor.
struct RunSlot {
	token: CancellationToken,
	active: usize,
}

/// Releases one occupancy of the run slot when a run finishes, panics
/// included.
struct RunGuard {
	task_uid: TaskUid,
	running: Arc<Mutex<HashMap<TaskUid, RunSlot>>>,
}

impl Drop for RunGuard {
	fn drop(&mut self) {
		let mut running = self.running.lock();
		if let Some(slot) = running.get_mut(&self.task_uid) {
			slot.active -= 1;
			if slot.active == 0 {
				running.remove(&self.task_uid);
			}
		}
	}
}

/// Caps how many deferred tasks a single process executes concurrently and
/// tracks in-flight runs so they can be cancelled.
///
/// Capacity is enforced with a semaphore. [`WorkerPool::has_free_slot`] is
/// advisory only, so [`WorkerPool::run`] still waits for a permit when called
/// at capacity.
///
/// # Examples
///
/// ```no_run
/// use deferred_tasks::WorkerPool;
///
/// let pool = WorkerPool::new(100);
/// assert!(pool.has_free_slot());
/// ```
pub struct WorkerPool {
	slots: Arc<Semaphore>,
	running: Arc<Mutex<HashMap<TaskUid, RunSlot>>>,
}

impl WorkerPool {
	/// Create a pool with `capacity` concurrent execution slots
	pub fn new(capacity: usize) -> Self {
		Self {
			slots: Arc::new(Semaphore::new(capacity)),
			running: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Whether at least one execution slot is currently free.
	///
	/// A snapshot, not a reservation. Another caller may take the slot
	/// before [`WorkerPool::run`] acquires it.
	pub fn has_free_slot(&self) -> bool {
		self.slots.available_permits() > 0
	}

	/// Number of runs currently in flight
	pub fn running_count(&self) -> usize {
		self.running.lock().len()
	}

	/// Execute `handler.run_deferred` under a slot, a timeout and a
	/// cancellation token.
	///
	/// Never returns an `Err`: every outcome, including a timeout or a
	/// cancellation, is folded into an [`ExecutionResult`].
	pub async fn run(
		&self,
		handler: Arc<dyn DeferredHandler>,
		task_uid: TaskUid,
		context: DeferredContext,
		timeout: Duration,
	) -> ExecutionResult {
		let permit = match self.slots.clone().acquire_owned().await {
			Ok(permit) => permit,
			// only possible if the semaphore is closed, which we never do
			Err(_) => {
				return ExecutionResult::Error(ExecutionError {
					message: "worker pool is shut down".to_string(),
					stack_trace: String::new(),
				});
			}
		};

		let token = {
			let mut running = self.running.lock();
			let slot = running.entry(task_uid.clone()).or_insert_with(|| RunSlot {
				token: CancellationToken::new(),
				active: 0,
			});
			slot.active += 1;
			slot.token.clone()
		};
		let _guard = RunGuard {
			task_uid: task_uid.clone(),
			running: Arc::clone(&self.running),
		};

		let started = Instant::now();
		debug!(task_uid = %task_uid, timeout_secs = timeout.as_secs_f64(), "Starting deferred run");

		let result = tokio::select! {
			_ = token.cancelled() => ExecutionResult::Cancelled,
			run = tokio::time::timeout(timeout, handler.run_deferred(context)) => {
				match run {
					Ok(Ok(value)) => ExecutionResult::Success { value },
					Ok(Err(error)) => ExecutionResult::Error(ExecutionError::from_error(&error)),
					Err(_) => ExecutionResult::Error(ExecutionError::timed_out(timeout)),
				}
			}
		};

		debug!(
			task_uid = %task_uid,
			elapsed_secs = started.elapsed().as_secs_f64(),
			success = result.is_success(),
			"Finished deferred run"
		);

		drop(permit);
		result
	}

	/// Request cancellation of an in-flight run.
	///
	/// Returns `false` when no run with this uid is executing in this
	/// process. Cancellation is cooperative: the handler future is dropped
	/// at its next await point.
	pub fn cancel_run(&self, task_uid: &TaskUid) -> bool {
		match self.running.lock().get(task_uid) {
			Some(slot) => {
				slot.token.cancel();
				true
			}
			None => {
				warn!(task_uid = %task_uid, "No in-flight run to cancel in this process");
				false
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::task::StartContext;
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::sync::Notify;

	struct SleepyHandler {
		sleep: Duration,
		in_flight: Arc<AtomicUsize>,
		peak: Arc<AtomicUsize>,
	}

	impl SleepyHandler {
		fn new(sleep: Duration) -> Self {
			Self {
				sleep,
				in_flight: Arc::new(AtomicUsize::new(0)),
				peak: Arc::new(AtomicUsize::new(0)),
			}
		}
	}

	#[async_trait]
	impl DeferredHandler for SleepyHandler {
		async fn get_timeout(&self, _context: &DeferredContext) -> Duration {
			Duration::from_secs(60)
		}

		async fn start_deferred(&self, args: StartContext) -> anyhow::Result<StartContext> {
			Ok(args)
		}

		async fn run_deferred(
			&self,
			_context: DeferredContext,
		) -> anyhow::Result<serde_json::Value> {
			let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(self.sleep).await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);
			Ok(serde_json::json!("done"))
		}

		async fn on_deferred_created(
			&self,
			_task_uid: &TaskUid,
			_context: &DeferredContext,
		) -> anyhow::Result<()> {
			Ok(())
		}

		async fn on_deferred_result(
			&self,
			_value: serde_json::Value,
			_context: DeferredContext,
		) -> anyhow::Result<()> {
			Ok(())
		}
	}

	struct FailingHandler;

	#[async_trait]
	impl DeferredHandler for FailingHandler {
		async fn get_timeout(&self, _context: &DeferredContext) -> Duration {
			Duration::from_secs(60)
		}

		async fn start_deferred(&self, args: StartContext) -> anyhow::Result<StartContext> {
			Ok(args)
		}

		async fn run_deferred(
			&self,
			_context: DeferredContext,
		) -> anyhow::Result<serde_json::Value> {
			anyhow::bail!("boom")
		}

		async fn on_deferred_created(
			&self,
			_task_uid: &TaskUid,
			_context: &DeferredContext,
		) -> anyhow::Result<()> {
			Ok(())
		}

		async fn on_deferred_result(
			&self,
			_value: serde_json::Value,
			_context: DeferredContext,
		) -> anyhow::Result<()> {
			Ok(())
		}
	}

	struct BlockedHandler {
		started: Arc<Notify>,
		starts: Arc<AtomicUsize>,
	}

	impl BlockedHandler {
		fn new(started: Arc<Notify>) -> Self {
			Self {
				started,
				starts: Arc::new(AtomicUsize::new(0)),
			}
		}
	}

	#[async_trait]
	impl DeferredHandler for BlockedHandler {
		async fn get_timeout(&self, _context: &DeferredContext) -> Duration {
			Duration::from_secs(60)
		}

		async fn start_deferred(&self, args: StartContext) -> anyhow::Result<StartContext> {
			Ok(args)
		}

		async fn run_deferred(
			&self,
			_context: DeferredContext,
		) -> anyhow::Result<serde_json::Value> {
			self.starts.fetch_add(1, Ordering::SeqCst);
			self.started.notify_one();
			std::future::pending::<()>().await;
			unreachable!()
		}

		async fn on_deferred_created(
			&self,
			_task_uid: &TaskUid,
			_context: &DeferredContext,
		) -> anyhow::Result<()> {
			Ok(())
		}

		async fn on_deferred_result(
			&self,
			_value: serde_json::Value,
			_context: DeferredContext,
		) -> anyhow::Result<()> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn test_success_result() {
		let pool = WorkerPool::new(1);
		let handler = Arc::new(SleepyHandler::new(Duration::from_millis(1)));

		let result = pool
			.run(
				handler,
				TaskUid::from("ok"),
				DeferredContext::new(),
				Duration::from_secs(5),
			)
			.await;

		assert_eq!(
			result,
			ExecutionResult::Success {
				value: serde_json::json!("done")
			}
		);
		assert!(pool.has_free_slot());
		assert_eq!(pool.running_count(), 0);
	}

	#[tokio::test]
	async fn test_handler_error_is_captured() {
		let pool = WorkerPool::new(1);

		let result = pool
			.run(
				Arc::new(FailingHandler),
				TaskUid::from("fails"),
				DeferredContext::new(),
				Duration::from_secs(5),
			)
			.await;

		match result {
			ExecutionResult::Error(error) => assert_eq!(error.message, "boom"),
			other => panic!("expected error result, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn test_timeout_produces_error() {
		let pool = WorkerPool::new(1);
		let handler = Arc::new(SleepyHandler::new(Duration::from_secs(60)));

		let result = pool
			.run(
				handler,
				TaskUid::from("slow"),
				DeferredContext::new(),
				Duration::from_millis(20),
			)
			.await;

		match result {
			ExecutionResult::Error(error) => {
				assert!(error.message.contains("timed out"), "{}", error.message)
			}
			other => panic!("expected timeout error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn test_capacity_bounds_concurrency() {
		let pool = Arc::new(WorkerPool::new(2));
		let handler = Arc::new(SleepyHandler::new(Duration::from_millis(50)));

		let mut joins = Vec::new();
		for i in 0..5 {
			let pool = Arc::clone(&pool);
			let handler = Arc::clone(&handler);
			joins.push(tokio::spawn(async move {
				pool.run(
					handler,
					TaskUid::from(format!("task-{i}")),
					DeferredContext::new(),
					Duration::from_secs(5),
				)
				.await
			}));
		}
		for join in joins {
			assert!(join.await.unwrap().is_success());
		}

		assert!(handler.peak.load(Ordering::SeqCst) <= 2);
	}

	#[tokio::test]
	async fn test_cancel_in_flight_run() {
		let pool = Arc::new(WorkerPool::new(1));
		let started = Arc::new(Notify::new());
		let handler = Arc::new(BlockedHandler::new(Arc::clone(&started)));

		let run = {
			let pool = Arc::clone(&pool);
			tokio::spawn(async move {
				pool.run(
					handler,
					TaskUid::from("blocked"),
					DeferredContext::new(),
					Duration::from_secs(60),
				)
				.await
			})
		};

		started.notified().await;
		assert!(pool.cancel_run(&TaskUid::from("blocked")));

		let result = run.await.unwrap();
		assert_eq!(result, ExecutionResult::Cancelled);
		assert!(pool.has_free_slot());
	}

	#[tokio::test]
	async fn test_cancel_unknown_run_is_false() {
		let pool = WorkerPool::new(1);
		assert!(!pool.cancel_run(&TaskUid::from("missing")));
	}

	#[tokio::test]
	async fn test_cancel_reaches_duplicate_runs_of_same_uid() {
		let pool = Arc::new(WorkerPool::new(2));
		let started = Arc::new(Notify::new());
		let handler = Arc::new(BlockedHandler::new(Arc::clone(&started)));

		// a redelivered message can start a second run for the same uid
		let mut joins = Vec::new();
		for _ in 0..2 {
			let pool = Arc::clone(&pool);
			let handler = Arc::clone(&handler);
			joins.push(tokio::spawn(async move {
				pool.run(
					handler,
					TaskUid::from("duplicated"),
					DeferredContext::new(),
					Duration::from_secs(60),
				)
				.await
			}));
		}

		while handler.starts.load(Ordering::SeqCst) < 2 {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}

		assert!(pool.cancel_run(&TaskUid::from("duplicated")));
		for join in joins {
			assert_eq!(join.await.unwrap(), ExecutionResult::Cancelled);
		}
		assert_eq!(pool.running_count(), 0);
		assert!(pool.has_free_slot());
	}
}
