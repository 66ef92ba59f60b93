//! Handler registry for dispatch by class reference
//!
//! Persisted records and stage messages carry only a
//! [`ClassUniqueReference`]; this registry is the explicit table mapping each
//! reference to its [`DeferredHandler`] implementation. It is built by the
//! hosting process and passed into the scheduler's constructor — there is no
//! implicit global registration.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::handler::DeferredHandler;
use crate::task::ClassUniqueReference;

/// Registration table of handler kinds.
///
/// # Examples
///
/// ```rust,no_run
/// use deferred_tasks::HandlerRegistry;
/// use std::sync::Arc;
///
/// # use async_trait::async_trait;
/// # use deferred_tasks::{DeferredContext, DeferredHandler, StartContext, TaskUid};
/// # use std::time::Duration;
/// # struct ExportReport;
/// # #[async_trait]
/// # impl DeferredHandler for ExportReport {
/// #     async fn get_timeout(&self, _c: &DeferredContext) -> Duration { Duration::from_secs(1) }
/// #     async fn start_deferred(&self, args: StartContext) -> anyhow::Result<StartContext> { Ok(args) }
/// #     async fn run_deferred(&self, _c: DeferredContext) -> anyhow::Result<serde_json::Value> {
/// #         Ok(serde_json::Value::Null)
/// #     }
/// #     async fn on_deferred_created(&self, _t: &TaskUid, _c: &DeferredContext) -> anyhow::Result<()> { Ok(()) }
/// #     async fn on_deferred_result(&self, _v: serde_json::Value, _c: DeferredContext) -> anyhow::Result<()> { Ok(()) }
/// # }
/// # async fn example() {
/// let registry = HandlerRegistry::new();
/// registry
///     .register("reports.Export", Arc::new(ExportReport))
///     .await;
/// assert!(registry.has(&"reports.Export".into()).await);
/// # }
/// ```
pub struct HandlerRegistry {
	handlers: RwLock<HashMap<ClassUniqueReference, Arc<dyn DeferredHandler>>>,
}

impl HandlerRegistry {
	/// Create an empty registry
	pub fn new() -> Self {
		Self {
			handlers: RwLock::new(HashMap::new()),
		}
	}

	/// Register a handler under its class reference, replacing any previous
	/// registration for the same reference.
	pub async fn register(
		&self,
		class_unique_reference: impl Into<ClassUniqueReference>,
		handler: Arc<dyn DeferredHandler>,
	) {
		let mut handlers = self.handlers.write().await;
		handlers.insert(class_unique_reference.into(), handler);
	}

	/// Remove a registration
	pub async fn unregister(&self, class_unique_reference: &ClassUniqueReference) {
		let mut handlers = self.handlers.write().await;
		handlers.remove(class_unique_reference);
	}

	/// Check whether a handler kind is registered
	pub async fn has(&self, class_unique_reference: &ClassUniqueReference) -> bool {
		let handlers = self.handlers.read().await;
		handlers.contains_key(class_unique_reference)
	}

	/// Look up the handler registered under a reference
	pub async fn get(
		&self,
		class_unique_reference: &ClassUniqueReference,
	) -> Option<Arc<dyn DeferredHandler>> {
		let handlers = self.handlers.read().await;
		handlers.get(class_unique_reference).cloned()
	}

	/// All registered class references
	pub async fn list(&self) -> Vec<ClassUniqueReference> {
		let handlers = self.handlers.read().await;
		handlers.keys().cloned().collect()
	}
}

impl Default for HandlerRegistry {
	fn default() -> Self {
		Self::new()
	}
}
