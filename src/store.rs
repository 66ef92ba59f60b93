//! Task record store: durable, cross-process storage of task schedules
//!
//! The store is the single source of truth for task state; every scheduler
//! process in a deployment reads and writes the same records. Two
//! implementations are provided:
//!
//! - [`RedisTaskStore`](redis::RedisTaskStore): the production store
//! - [`InMemoryTaskStore`](memory::InMemoryTaskStore): non-persistent, for
//!   development and testing

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::schedule::TaskSchedule;
use crate::task::TaskUid;

/// Persistence contract for [`TaskSchedule`] records, keyed by [`TaskUid`].
///
/// Reads and writes are plain get/save with no compare-and-swap: two
/// competing consumers racing on the same record can lose an update. The
/// scheduler's state-check discipline makes this safe in practice because a
/// stale transition is rejected on the next read.
#[async_trait]
pub trait TaskStore: Send + Sync {
	/// Load the record for a task, if present
	async fn get(&self, task_uid: &TaskUid) -> Result<Option<TaskSchedule>, StoreError>;

	/// Persist the record, overwriting any previous value
	async fn save(&self, task_uid: &TaskUid, schedule: &TaskSchedule) -> Result<(), StoreError>;

	/// Remove the record; removing an absent record is not an error
	async fn remove(&self, task_uid: &TaskUid) -> Result<(), StoreError>;

	/// All stored records; operational introspection, not on the hot path
	async fn list_all(&self) -> Result<Vec<TaskSchedule>, StoreError>;

	/// Mint an identifier that is absent from the store at mint time.
	///
	/// Candidates are generated until one is unused. This is collision
	/// *avoidance*, not a guarantee under concurrent minting; the
	/// identifier space makes an actual collision negligible.
	async fn mint_unique_id(&self) -> Result<TaskUid, StoreError> {
		loop {
			let candidate = TaskUid::from(Uuid::new_v4().simple().to_string());
			if self.get(&candidate).await?.is_none() {
				return Ok(candidate);
			}
		}
	}
}
