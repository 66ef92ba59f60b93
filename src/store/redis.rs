//! Redis-backed task record store

use async_trait::async_trait;
use redis::{AsyncCommands, RedisError, aio::ConnectionManager};
use std::sync::Arc;

use crate::error::StoreError;
use crate::schedule::TaskSchedule;
use crate::store::TaskStore;
use crate::task::TaskUid;

/// Number of keys to scan per SCAN iteration in `list_all`
const SCAN_BATCH_SIZE: usize = 100;

/// Production [`TaskStore`] keeping one JSON-serialized [`TaskSchedule`] per
/// key `"<prefix><TaskUid>"`. Every scheduler process of a deployment points
/// at the same Redis database, which is what makes records survive process
/// restarts and be visible fleet-wide.
///
/// # Examples
///
/// ```no_run
/// use deferred_tasks::RedisTaskStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RedisTaskStore::new("redis://127.0.0.1/").await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisTaskStore {
	connection: Arc<ConnectionManager>,
	key_prefix: String,
}

impl RedisTaskStore {
	/// Connect with the default key prefix
	pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
		Self::with_prefix(redis_url, "deferred:tasks:".to_string()).await
	}

	/// Connect with a custom key prefix.
	///
	/// Independent deployments sharing one Redis database must use distinct
	/// prefixes.
	pub async fn with_prefix(redis_url: &str, key_prefix: String) -> Result<Self, RedisError> {
		let client = redis::Client::open(redis_url)?;
		let connection = ConnectionManager::new(client).await?;

		Ok(Self {
			connection: Arc::new(connection),
			key_prefix,
		})
	}

	fn record_key(&self, task_uid: &TaskUid) -> String {
		format!("{}{}", self.key_prefix, task_uid)
	}
}

#[async_trait]
impl TaskStore for RedisTaskStore {
	async fn get(&self, task_uid: &TaskUid) -> Result<Option<TaskSchedule>, StoreError> {
		let mut conn = (*self.connection).clone();

		let raw: Option<String> = conn
			.get(self.record_key(task_uid))
			.await
			.map_err(|e: RedisError| StoreError::Backend(e.to_string()))?;

		match raw {
			Some(json) => Ok(Some(serde_json::from_str(&json)?)),
			None => Ok(None),
		}
	}

	async fn save(&self, task_uid: &TaskUid, schedule: &TaskSchedule) -> Result<(), StoreError> {
		let json = serde_json::to_string(schedule)?;
		let mut conn = (*self.connection).clone();

		let _: () = conn
			.set(self.record_key(task_uid), json)
			.await
			.map_err(|e: RedisError| StoreError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn remove(&self, task_uid: &TaskUid) -> Result<(), StoreError> {
		let mut conn = (*self.connection).clone();

		let _: () = conn
			.del(self.record_key(task_uid))
			.await
			.map_err(|e: RedisError| StoreError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn list_all(&self) -> Result<Vec<TaskSchedule>, StoreError> {
		let mut conn = (*self.connection).clone();
		let pattern = format!("{}*", self.key_prefix);

		// SCAN instead of KEYS so a large deployment cannot block Redis
		let mut keys: Vec<String> = Vec::new();
		let mut cursor: u64 = 0;
		loop {
			let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
				.arg(cursor)
				.arg("MATCH")
				.arg(&pattern)
				.arg("COUNT")
				.arg(SCAN_BATCH_SIZE)
				.query_async(&mut conn)
				.await
				.map_err(|e: RedisError| StoreError::Backend(e.to_string()))?;

			keys.extend(batch);
			cursor = next_cursor;
			if cursor == 0 {
				break;
			}
		}

		let mut schedules = Vec::with_capacity(keys.len());
		for key in keys {
			let raw: Option<String> = conn
				.get(&key)
				.await
				.map_err(|e: RedisError| StoreError::Backend(e.to_string()))?;
			// a record may have been removed between SCAN and GET
			if let Some(json) = raw {
				schedules.push(serde_json::from_str(&json)?);
			}
		}

		Ok(schedules)
	}
}
