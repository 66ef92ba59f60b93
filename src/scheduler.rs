//! Message-driven orchestrator for the deferred-task lifecycle
//!
//! Every state transition travels as a RabbitMQ message whose payload is the
//! [`TaskUid`]. Stage queues hang off a direct exchange shared by all
//! scheduler processes; cancellation requests fan out to a per-process
//! queue so every process sees them.

use futures_util::StreamExt;
use lapin::{
	BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
	message::Delivery, options::*, types::FieldTable,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, TaskError, TaskResult};
use crate::registry::HandlerRegistry;
use crate::result::ExecutionResult;
use crate::schedule::TaskSchedule;
use crate::store::TaskStore;
use crate::task::{
	ClassUniqueReference, GlobalsContext, StartContext, TaskState, TaskUid, merge_contexts,
};
use crate::worker_pool::WorkerPool;

/// Stage queues bound to the direct exchange, in pipeline order
const STAGE_STATES: [TaskState; 6] = [
	TaskState::Scheduled,
	TaskState::SubmitTask,
	TaskState::Worker,
	TaskState::ErrorResult,
	TaskState::FinishedWithError,
	TaskState::DeferredResult,
];

/// Configuration for a [`DeferredScheduler`].
///
/// # Examples
///
/// ```no_run
/// use deferred_tasks::SchedulerConfig;
/// use std::time::Duration;
///
/// let config = SchedulerConfig::new("amqp://localhost:5672/%2f")
///     .with_namespace("billing")
///     .with_worker_slots(10)
///     .with_requeue_delay(Duration::from_millis(200));
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	/// AMQP connection URL (e.g., "amqp://localhost:5672/%2f")
	pub amqp_url: String,
	/// Prefix for every exchange and queue name. Two deployments sharing a
	/// broker must use distinct namespaces.
	pub namespace: String,
	/// Concurrent execution slots of this process's worker pool
	pub worker_slots: usize,
	/// How long to hold a worker-stage message before requeueing it when
	/// all local slots are busy
	pub requeue_delay: Duration,
}

impl SchedulerConfig {
	/// Create a configuration with default namespace, slots and delay
	pub fn new(amqp_url: &str) -> Self {
		Self {
			amqp_url: amqp_url.to_string(),
			namespace: "deferred_tasks".to_string(),
			worker_slots: 100,
			requeue_delay: Duration::from_secs(1),
		}
	}

	/// Set the exchange/queue namespace prefix
	pub fn with_namespace(mut self, namespace: &str) -> Self {
		self.namespace = namespace.to_string();
		self
	}

	/// Set the worker-pool capacity of this process
	pub fn with_worker_slots(mut self, worker_slots: usize) -> Self {
		self.worker_slots = worker_slots;
		self
	}

	/// Set the backpressure requeue delay
	pub fn with_requeue_delay(mut self, requeue_delay: Duration) -> Self {
		self.requeue_delay = requeue_delay;
		self
	}
}

/// Why a stage handler did not complete normally. Decides the fate of the
/// in-flight message.
#[derive(Debug, Error)]
enum StageError {
	/// No local capacity; put the message back after a delay.
	#[error("no free worker slot, requeueing")]
	Requeue,

	/// The message is stale (the task was cancelled or already finished);
	/// drop it quietly.
	#[error("message abandoned")]
	Abandoned,

	/// No record exists for the task. Either a cancellation removed it with
	/// a stage message still in flight, or the stores are inconsistent.
	#[error("no record found for task")]
	MissingSchedule,

	/// The record is not in the state this queue expects.
	#[error("record in state {found}, expected {expected}")]
	UnexpectedState { expected: TaskState, found: TaskState },

	/// The record's result does not fit this stage.
	#[error("record carries a result inconsistent with this stage")]
	UnexpectedResult,

	/// No handler registered for the record's class reference.
	#[error("no handler registered for '{0}'")]
	UnknownHandler(ClassUniqueReference),

	/// The scheduler lost its broker connection.
	#[error("not connected to the broker")]
	NotConnected,

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("broker error: {0}")]
	Broker(#[from] lapin::Error),
}

struct BrokerState {
	connection: Connection,
	channel: Channel,
	consumers: Vec<JoinHandle<()>>,
}

struct SchedulerInner {
	config: SchedulerConfig,
	store: Arc<dyn TaskStore>,
	registry: Arc<HandlerRegistry>,
	globals: GlobalsContext,
	pool: WorkerPool,
	broker: RwLock<Option<BrokerState>>,
}

/// The per-process scheduler: starts tasks, consumes the stage queues and
/// drives every task record through its lifecycle.
///
/// All processes of a deployment share the same broker namespace and task
/// store; any process may pick up any stage message, so a task started on
/// one node can execute and finish on another.
///
/// Cloning is cheap and clones share the same connection and worker pool.
///
/// # Examples
///
/// ```no_run
/// use deferred_tasks::{
///     DeferredScheduler, HandlerRegistry, InMemoryTaskStore, SchedulerConfig,
/// };
/// use std::collections::HashMap;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Arc::new(HandlerRegistry::new());
/// let scheduler = DeferredScheduler::new(
///     SchedulerConfig::new("amqp://localhost:5672/%2f"),
///     Arc::new(InMemoryTaskStore::new()),
///     registry,
///     HashMap::new(),
/// );
/// scheduler.setup().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeferredScheduler {
	inner: Arc<SchedulerInner>,
}

impl DeferredScheduler {
	/// Create a scheduler; no broker connection is made until
	/// [`setup`](Self::setup).
	pub fn new(
		config: SchedulerConfig,
		store: Arc<dyn TaskStore>,
		registry: Arc<HandlerRegistry>,
		globals: GlobalsContext,
	) -> Self {
		let pool = WorkerPool::new(config.worker_slots);
		Self {
			inner: Arc::new(SchedulerInner {
				config,
				store,
				registry,
				globals,
				pool,
				broker: RwLock::new(None),
			}),
		}
	}

	/// The configuration this scheduler was built with
	pub fn config(&self) -> &SchedulerConfig {
		&self.inner.config
	}

	fn common_exchange(&self) -> String {
		format!("{}_common", self.inner.config.namespace)
	}

	fn cancellation_exchange(&self) -> String {
		format!("{}_cancellation", self.inner.config.namespace)
	}

	fn stage_queue_name(&self, state: TaskState) -> String {
		format!("{}_{}", self.inner.config.namespace, state)
	}

	/// Connect to the broker, declare the topology and start consuming.
	pub async fn setup(&self) -> TaskResult<()> {
		let connection =
			Connection::connect(&self.inner.config.amqp_url, ConnectionProperties::default())
				.await?;
		let channel = connection.create_channel().await?;

		channel
			.exchange_declare(
				&self.common_exchange(),
				ExchangeKind::Direct,
				ExchangeDeclareOptions {
					durable: true,
					..Default::default()
				},
				FieldTable::default(),
			)
			.await?;
		channel
			.exchange_declare(
				&self.cancellation_exchange(),
				ExchangeKind::Fanout,
				ExchangeDeclareOptions {
					durable: true,
					..Default::default()
				},
				FieldTable::default(),
			)
			.await?;

		let mut consumers = Vec::with_capacity(STAGE_STATES.len() + 1);

		for state in STAGE_STATES {
			let queue_name = self.stage_queue_name(state);
			channel
				.queue_declare(
					&queue_name,
					QueueDeclareOptions {
						durable: true,
						..Default::default()
					},
					FieldTable::default(),
				)
				.await?;
			channel
				.queue_bind(
					&queue_name,
					&self.common_exchange(),
					&queue_name,
					QueueBindOptions::default(),
					FieldTable::default(),
				)
				.await?;

			consumers.push(self.spawn_consumer(&channel, &queue_name, state).await?);
		}

		// per-process queue so the fanout reaches every scheduler process
		let cancel_queue = format!(
			"{}_CANCEL_DEFERRED_{}",
			self.inner.config.namespace,
			Uuid::new_v4().simple()
		);
		channel
			.queue_declare(
				&cancel_queue,
				QueueDeclareOptions {
					exclusive: true,
					auto_delete: true,
					..Default::default()
				},
				FieldTable::default(),
			)
			.await?;
		channel
			.queue_bind(
				&cancel_queue,
				&self.cancellation_exchange(),
				"",
				QueueBindOptions::default(),
				FieldTable::default(),
			)
			.await?;
		consumers.push(
			self.spawn_consumer(&channel, &cancel_queue, TaskState::ManuallyCancelled)
				.await?,
		);

		let mut broker = self.inner.broker.write().await;
		*broker = Some(BrokerState {
			connection,
			channel,
			consumers,
		});

		info!(namespace = %self.inner.config.namespace, "Deferred scheduler is consuming");
		Ok(())
	}

	async fn spawn_consumer(
		&self,
		channel: &Channel,
		queue_name: &str,
		state: TaskState,
	) -> Result<JoinHandle<()>, lapin::Error> {
		let mut consumer = channel
			.basic_consume(
				queue_name,
				&format!("{queue_name}_consumer"),
				BasicConsumeOptions::default(),
				FieldTable::default(),
			)
			.await?;

		let scheduler = self.clone();
		let queue_name = queue_name.to_string();
		Ok(tokio::spawn(async move {
			while let Some(delivery) = consumer.next().await {
				match delivery {
					Ok(delivery) => {
						let scheduler = scheduler.clone();
						tokio::spawn(async move {
							scheduler.process_delivery(state, delivery).await;
						});
					}
					Err(error) => {
						error!(queue = %queue_name, %error, "Consumer stream failed");
						break;
					}
				}
			}
		}))
	}

	async fn process_delivery(&self, state: TaskState, delivery: Delivery) {
		let task_uid = match std::str::from_utf8(&delivery.data) {
			Ok(payload) => TaskUid::from(payload),
			Err(error) => {
				error!(stage = %state, %error, "Dropping message with non-UTF-8 payload");
				Self::drop_message(&delivery).await;
				return;
			}
		};

		let outcome = match state {
			TaskState::Scheduled => self.handle_scheduled(&task_uid).await,
			TaskState::SubmitTask => self.handle_submit_task(&task_uid).await,
			TaskState::Worker => self.handle_worker(&task_uid).await,
			TaskState::ErrorResult => self.handle_error_result(&task_uid).await,
			TaskState::FinishedWithError => self.handle_finished_with_error(&task_uid).await,
			TaskState::DeferredResult => self.handle_deferred_result(&task_uid).await,
			TaskState::ManuallyCancelled => self.handle_cancel_deferred(&task_uid).await,
		};

		match outcome {
			Ok(()) => {
				if let Err(error) = delivery.acker.ack(BasicAckOptions::default()).await {
					warn!(stage = %state, task_uid = %task_uid, %error, "Failed to ack message");
				}
			}
			Err(StageError::Requeue) => {
				tokio::time::sleep(self.inner.config.requeue_delay).await;
				if let Err(error) = delivery
					.acker
					.nack(BasicNackOptions {
						requeue: true,
						..Default::default()
					})
					.await
				{
					warn!(stage = %state, task_uid = %task_uid, %error, "Failed to requeue message");
				}
			}
			Err(StageError::Abandoned) => {
				debug!(stage = %state, task_uid = %task_uid, "Dropping stale message");
				Self::drop_message(&delivery).await;
			}
			Err(StageError::MissingSchedule) => {
				warn!(stage = %state, task_uid = %task_uid, "No record for task, dropping message");
				Self::drop_message(&delivery).await;
			}
			Err(error) => {
				error!(stage = %state, task_uid = %task_uid, %error, "Stage handler failed, dropping message");
				Self::drop_message(&delivery).await;
			}
		}
	}

	async fn drop_message(delivery: &Delivery) {
		if let Err(error) = delivery
			.acker
			.reject(BasicRejectOptions { requeue: false })
			.await
		{
			warn!(%error, "Failed to reject message");
		}
	}

	async fn channel(&self) -> TaskResult<Channel> {
		let broker = self.inner.broker.read().await;
		match broker.as_ref() {
			Some(state) => Ok(state.channel.clone()),
			None => Err(TaskError::NotConnected),
		}
	}

	/// Publish a task uid as a persistent, confirmed message.
	async fn publish_to(
		channel: &Channel,
		exchange: &str,
		routing_key: &str,
		task_uid: &TaskUid,
	) -> Result<(), lapin::Error> {
		channel
			.basic_publish(
				exchange,
				routing_key,
				BasicPublishOptions::default(),
				task_uid.as_str().as_bytes(),
				BasicProperties::default().with_delivery_mode(2), // Persistent
			)
			.await?
			.await?;
		Ok(())
	}

	async fn publish_stage(&self, state: TaskState, task_uid: &TaskUid) -> Result<(), StageError> {
		let channel = self.channel().await.map_err(|_| StageError::NotConnected)?;
		let queue_name = self.stage_queue_name(state);
		Self::publish_to(&channel, &self.common_exchange(), &queue_name, task_uid).await?;

		debug!(task_uid = %task_uid, stage = %state, "Published stage message");
		Ok(())
	}

	/// Load a record and verify it sits in the state this queue expects.
	///
	/// A record in `MANUALLY_CANCELLED` means the message is stale; any
	/// other mismatch means duplicate delivery or an inconsistency, and the
	/// message must not be retried.
	async fn load_expected(
		&self,
		task_uid: &TaskUid,
		expected: TaskState,
	) -> Result<TaskSchedule, StageError> {
		let schedule = self
			.inner
			.store
			.get(task_uid)
			.await?
			.ok_or(StageError::MissingSchedule)?;

		if schedule.state == expected {
			return Ok(schedule);
		}
		if schedule.state == TaskState::ManuallyCancelled {
			return Err(StageError::Abandoned);
		}
		Err(StageError::UnexpectedState {
			expected,
			found: schedule.state,
		})
	}

	/// Start a new deferred task.
	///
	/// Persists the record and publishes the first stage message; any
	/// scheduler process may pick the task up from there. Returns the
	/// minted [`TaskUid`].
	pub async fn start_deferred(
		&self,
		class_unique_reference: impl Into<ClassUniqueReference>,
		args: StartContext,
	) -> TaskResult<TaskUid> {
		let class_unique_reference = class_unique_reference.into();
		let handler = self
			.inner
			.registry
			.get(&class_unique_reference)
			.await
			.ok_or_else(|| TaskError::UnknownHandler(class_unique_reference.clone()))?;

		// the returned context is what gets persisted
		let start_context = handler
			.start_deferred(args)
			.await
			.map_err(TaskError::Handler)?;
		let context = merge_contexts(&self.inner.globals, &start_context);

		let timeout = handler.get_timeout(&context).await;
		let retries = handler.get_retries(&context).await;

		let task_uid = self.inner.store.mint_unique_id().await?;
		let schedule = TaskSchedule::new(
			class_unique_reference.clone(),
			timeout,
			retries,
			start_context,
		);
		self.inner.store.save(&task_uid, &schedule).await?;

		let channel = self.channel().await?;
		Self::publish_to(
			&channel,
			&self.common_exchange(),
			&self.stage_queue_name(TaskState::Scheduled),
			&task_uid,
		)
		.await?;

		info!(
			task_uid = %task_uid,
			class = %class_unique_reference,
			"Started deferred task"
		);

		// a failing user hook must not fail the already-started task
		if let Err(error) = handler.on_deferred_created(&task_uid, &context).await {
			warn!(task_uid = %task_uid, %error, "on_deferred_created failed");
		}

		Ok(task_uid)
	}

	/// Request cancellation of a task.
	///
	/// Best effort: the record is marked and the request is broadcast to
	/// every scheduler process, but a run that never reaches an await point
	/// cannot be interrupted. Unknown or already-finished tasks are a
	/// logged no-op.
	pub async fn cancel_deferred(&self, task_uid: &TaskUid) -> TaskResult<()> {
		let Some(mut schedule) = self.inner.store.get(task_uid).await? else {
			warn!(task_uid = %task_uid, "Nothing to cancel, no record for task");
			return Ok(());
		};
		// a repeated cancel must not overwrite the pre-cancellation marker
		if schedule.state == TaskState::ManuallyCancelled {
			debug!(task_uid = %task_uid, "Cancellation already requested");
			return Ok(());
		}

		schedule.state_before_cancellation = Some(schedule.state);
		schedule.state = TaskState::ManuallyCancelled;
		self.inner.store.save(task_uid, &schedule).await?;

		let channel = self.channel().await?;
		Self::publish_to(&channel, &self.cancellation_exchange(), "", task_uid).await?;

		info!(task_uid = %task_uid, "Requested task cancellation");
		Ok(())
	}

	/// Whether a record still exists for the task. Lets callers poll for
	/// completion of fire-and-forget tasks.
	pub async fn is_present(&self, task_uid: &TaskUid) -> TaskResult<bool> {
		Ok(self.inner.store.get(task_uid).await?.is_some())
	}

	async fn handle_scheduled(&self, task_uid: &TaskUid) -> Result<(), StageError> {
		let mut schedule = self.load_expected(task_uid, TaskState::Scheduled).await?;

		schedule.state = TaskState::SubmitTask;
		self.inner.store.save(task_uid, &schedule).await?;
		self.publish_stage(TaskState::SubmitTask, task_uid).await
	}

	async fn handle_submit_task(&self, task_uid: &TaskUid) -> Result<(), StageError> {
		let mut schedule = self.load_expected(task_uid, TaskState::SubmitTask).await?;

		// one attempt of the budget is consumed here, not after failure
		schedule.remaining_retries = schedule.remaining_retries.saturating_sub(1);
		schedule.state = TaskState::Worker;
		self.inner.store.save(task_uid, &schedule).await?;
		self.publish_stage(TaskState::Worker, task_uid).await
	}

	async fn handle_worker(&self, task_uid: &TaskUid) -> Result<(), StageError> {
		let mut schedule = self.load_expected(task_uid, TaskState::Worker).await?;

		if !self.inner.pool.has_free_slot() {
			return Err(StageError::Requeue);
		}

		let handler = self
			.inner
			.registry
			.get(&schedule.class_unique_reference)
			.await
			.ok_or_else(|| StageError::UnknownHandler(schedule.class_unique_reference.clone()))?;
		let context = merge_contexts(&self.inner.globals, &schedule.start_context);

		let result = self
			.inner
			.pool
			.run(handler, task_uid.clone(), context, schedule.timeout)
			.await;

		let next_state = if result.is_success() {
			TaskState::DeferredResult
		} else {
			TaskState::ErrorResult
		};
		schedule.result = Some(result);
		schedule.state = next_state;
		self.inner.store.save(task_uid, &schedule).await?;
		self.publish_stage(next_state, task_uid).await
	}

	async fn handle_error_result(&self, task_uid: &TaskUid) -> Result<(), StageError> {
		let mut schedule = self.load_expected(task_uid, TaskState::ErrorResult).await?;

		let can_retry = match &schedule.result {
			Some(ExecutionResult::Error(_)) => schedule.remaining_retries > 0,
			// a cancelled run is never retried
			Some(ExecutionResult::Cancelled) => false,
			Some(ExecutionResult::Success { .. }) | None => {
				return Err(StageError::UnexpectedResult);
			}
		};

		if can_retry {
			debug!(
				task_uid = %task_uid,
				remaining_retries = schedule.remaining_retries,
				"Retrying failed task"
			);
			schedule.state = TaskState::SubmitTask;
			self.inner.store.save(task_uid, &schedule).await?;
			return self.publish_stage(TaskState::SubmitTask, task_uid).await;
		}

		schedule.state = TaskState::FinishedWithError;
		self.inner.store.save(task_uid, &schedule).await?;
		self.publish_stage(TaskState::FinishedWithError, task_uid)
			.await
	}

	async fn handle_finished_with_error(&self, task_uid: &TaskUid) -> Result<(), StageError> {
		let schedule = self
			.load_expected(task_uid, TaskState::FinishedWithError)
			.await?;

		match &schedule.result {
			Some(ExecutionResult::Error(execution_error)) => {
				error!(
					task_uid = %task_uid,
					class = %schedule.class_unique_reference,
					message = %execution_error.message,
					stack_trace = %execution_error.stack_trace,
					"Task failed permanently"
				);
				if let Some(handler) = self
					.inner
					.registry
					.get(&schedule.class_unique_reference)
					.await
				{
					let context = merge_contexts(&self.inner.globals, &schedule.start_context);
					if let Err(error) = handler
						.on_finished_with_error(execution_error, context)
						.await
					{
						warn!(task_uid = %task_uid, %error, "on_finished_with_error failed");
					}
				}
			}
			Some(ExecutionResult::Cancelled) => {
				info!(task_uid = %task_uid, "Task was cancelled");
			}
			Some(ExecutionResult::Success { .. }) | None => {
				return Err(StageError::UnexpectedResult);
			}
		}

		self.remove_finished(task_uid, &schedule).await
	}

	async fn handle_deferred_result(&self, task_uid: &TaskUid) -> Result<(), StageError> {
		let schedule = self
			.load_expected(task_uid, TaskState::DeferredResult)
			.await?;

		let Some(ExecutionResult::Success { value }) = &schedule.result else {
			return Err(StageError::UnexpectedResult);
		};

		let handler = self
			.inner
			.registry
			.get(&schedule.class_unique_reference)
			.await
			.ok_or_else(|| StageError::UnknownHandler(schedule.class_unique_reference.clone()))?;
		let context = merge_contexts(&self.inner.globals, &schedule.start_context);
		if let Err(error) = handler.on_deferred_result(value.clone(), context).await {
			warn!(task_uid = %task_uid, %error, "on_deferred_result failed");
		}

		self.remove_finished(task_uid, &schedule).await
	}

	async fn handle_cancel_deferred(&self, task_uid: &TaskUid) -> Result<(), StageError> {
		let Some(schedule) = self.inner.store.get(task_uid).await? else {
			// already removed, or cancelled after finishing
			return Err(StageError::Abandoned);
		};
		if schedule.state != TaskState::ManuallyCancelled {
			return Err(StageError::Abandoned);
		}

		if schedule.state_before_cancellation == Some(TaskState::Worker) {
			// when the run executes here, remove the record as soon as the
			// cancel lands, so a crash before the worker stage persists
			// the Cancelled result cannot leak it; the result pipeline
			// re-saves and removes the record again on its way out. When
			// the run is not local, the process actually running it
			// handles this same broadcast.
			if self.inner.pool.cancel_run(task_uid) {
				self.inner.store.remove(task_uid).await?;
				info!(task_uid = %task_uid, "Cancelled running task");
			}
			return Ok(());
		}

		// the task never reached execution; stop it by removing the record
		self.inner.store.remove(task_uid).await?;
		info!(task_uid = %task_uid, "Cancelled task before execution");
		Ok(())
	}

	async fn remove_finished(
		&self,
		task_uid: &TaskUid,
		schedule: &TaskSchedule,
	) -> Result<(), StageError> {
		self.inner.store.remove(task_uid).await?;
		info!(
			task_uid = %task_uid,
			class = %schedule.class_unique_reference,
			elapsed_secs = schedule.elapsed().num_milliseconds() as f64 / 1000.0,
			"Finished task"
		);
		Ok(())
	}

	/// Stop consuming and close the broker connection. Safe to call on a
	/// scheduler that was never set up.
	pub async fn shutdown(&self) -> TaskResult<()> {
		let mut broker = self.inner.broker.write().await;
		if let Some(state) = broker.take() {
			for consumer in state.consumers {
				consumer.abort();
			}
			state.connection.close(320, "shutting down").await?;
		}
		Ok(())
	}
}
