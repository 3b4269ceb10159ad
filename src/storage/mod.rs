//! Storage adapter contract.
//!
//! The kernel consumes persistence through this narrow async key/value
//! interface keyed by `(namespace, key)`. Every operation may suspend and may
//! fail with [`Error::Transport`](crate::types::Error::Transport); callers treat
//! such failures as non-retryable unless they retry explicitly.
//!
//! Two reference adapters ship with the crate: [`MemoryStorage`] for tests and
//! ephemeral runs, and [`FileStorage`] which keeps one JSON document per
//! namespace on disk.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::Result;

/// Async key/value persistence.
///
/// Implementations must be safe for concurrent invocation.
#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    /// Read a value; `Ok(None)` when the key is absent.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    /// Durably write a value.
    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// All keys in a namespace, in ascending order.
    async fn list(&self, namespace: &str) -> Result<Vec<String>>;

    /// Every `(key, value)` pair of a namespace, in ascending key order.
    ///
    /// The default issues one `get` per listed key. Adapters that hold a
    /// namespace as a single document should override it.
    async fn scan(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let mut entries = Vec::new();
        for key in self.list(namespace).await? {
            if let Some(value) = self.get(namespace, &key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }
}

/// Namespaces under this prefix belong to the auth subsystem and are not
/// reachable through the state mirror.
pub const RESERVED_NAMESPACE_PREFIX: &str = "auth.";

pub fn is_reserved_namespace(namespace: &str) -> bool {
    namespace.starts_with(RESERVED_NAMESPACE_PREFIX)
}
