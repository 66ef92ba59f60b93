//! In-memory task record store for development and testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::schedule::TaskSchedule;
use crate::store::TaskStore;
use crate::task::TaskUid;

/// Non-persistent [`TaskStore`] backed by a `HashMap`.
///
/// Records are lost when the process exits, so this is only suitable for a
/// single-process deployment — typically tests.
///
/// # Examples
///
/// ```rust
/// use deferred_tasks::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// ```
pub struct InMemoryTaskStore {
	records: Arc<RwLock<HashMap<TaskUid, TaskSchedule>>>,
}

impl InMemoryTaskStore {
	/// Create an empty store
	pub fn new() -> Self {
		Self {
			records: Arc::new(RwLock::new(HashMap::new())),
		}
	}

	/// Number of stored records
	pub async fn len(&self) -> usize {
		self.records.read().await.len()
	}

	/// True when no records are stored
	pub async fn is_empty(&self) -> bool {
		self.records.read().await.is_empty()
	}
}

impl Default for InMemoryTaskStore {
	fn default() -> Self {
		Self::new()
	}
}

impl Clone for InMemoryTaskStore {
	fn clone(&self) -> Self {
		Self {
			records: Arc::clone(&self.records),
		}
	}
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
	async fn get(&self, task_uid: &TaskUid) -> Result<Option<TaskSchedule>, StoreError> {
		let records = self.records.read().await;
		Ok(records.get(task_uid).cloned())
	}

	async fn save(&self, task_uid: &TaskUid, schedule: &TaskSchedule) -> Result<(), StoreError> {
		let mut records = self.records.write().await;
		records.insert(task_uid.clone(), schedule.clone());
		Ok(())
	}

	async fn remove(&self, task_uid: &TaskUid) -> Result<(), StoreError> {
		let mut records = self.records.write().await;
		records.remove(task_uid);
		Ok(())
	}

	async fn list_all(&self) -> Result<Vec<TaskSchedule>, StoreError> {
		let records = self.records.read().await;
		Ok(records.values().cloned().collect())
	}
}
