//! Action adapter contract and the ordered adapter registry
//!
//! Dispatch walks the registry front to back and hands the action to the
//! first adapter whose [`ActionAdapter::can_handle`] accepts it. Adapters
//! registered later are placed at the front, so a host can override the
//! default handling of a kind by registering its own adapter after startup.

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};

use crate::{ActionDefinition, ExecutionResult};

/// Error string reported when no adapter claims an action
pub const NO_ADAPTER: &str = "no_adapter";

/// Executes one family of actions
#[async_trait]
pub trait ActionAdapter: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &str;

    /// Whether this adapter can execute `action`
    fn can_handle(&self, action: &ActionDefinition) -> bool;

    /// Execute the action; failures are reported as `ok: false`
    async fn execute(&self, action: &ActionDefinition) -> ExecutionResult;
}

/// Ordered list of adapters; earlier entries take priority
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<Vec<Arc<dyn ActionAdapter>>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter ahead of every existing one
    pub fn register(&self, adapter: Arc<dyn ActionAdapter>) {
        tracing::debug!(adapter = adapter.name(), "registered adapter (front)");
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(0, adapter);
    }

    /// Register an adapter behind every existing one
    pub fn register_fallback(&self, adapter: Arc<dyn ActionAdapter>) {
        tracing::debug!(adapter = adapter.name(), "registered adapter (back)");
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(adapter);
    }

    /// First adapter able to handle `action`
    #[must_use]
    pub fn resolve(&self, action: &ActionDefinition) -> Option<Arc<dyn ActionAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.can_handle(action))
            .cloned()
    }

    /// Execute `action` on the first matching adapter
    pub async fn dispatch(&self, action: &ActionDefinition) -> ExecutionResult {
        match self.resolve(action) {
            Some(adapter) => {
                tracing::debug!(adapter = adapter.name(), action = %action.label(), "dispatching action");
                adapter.execute(action).await
            }
            None => {
                tracing::debug!(action = %action.label(), kind = %action.kind(), "no adapter for action");
                ExecutionResult::failure(NO_ADAPTER)
            }
        }
    }

    /// Adapter names in priority order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    /// Number of registered adapters
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no adapter is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").field("adapters", &self.names()).finish()
    }
}
