//! Backend traits for the Remote and Durable storage tiers.
//!
//! The registry composes tiers through these traits so tests (and
//! embedded deployments) can swap the networked adapters for in-memory
//! ones.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use magick_core::error::AdapterError;

/// Result type for adapter operations.
pub type StoreResult<T> = Result<T, AdapterError>;

/// A live subscription to the invalidation channel.
///
/// Messages are plain flag names. The adapter owns the connection and
/// pumps messages into this bounded inbox; dropping the subscription
/// ends the pump.
pub struct Subscription {
    receiver: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<String>) -> Self {
        Self { receiver }
    }

    /// Receive the next invalidated flag name. `None` means the
    /// subscription ended and must be re-established.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Shared networked key/value tier with hash-per-flag layout, an
/// invalidation channel, and the counters the metrics pipeline flushes
/// into.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn get(&self, name: &str, key: &str) -> StoreResult<Option<String>>;

    async fn get_fields(&self, name: &str) -> StoreResult<BTreeMap<String, String>>;

    async fn set(&self, name: &str, key: &str, value: &str) -> StoreResult<()>;

    async fn set_fields(&self, name: &str, fields: &BTreeMap<String, String>) -> StoreResult<()>;

    async fn delete(&self, name: &str) -> StoreResult<()>;

    async fn exists(&self, name: &str) -> StoreResult<bool>;

    async fn feature_names(&self) -> StoreResult<Vec<String>>;

    async fn clear(&self) -> StoreResult<()>;

    /// Publish a flag name on the invalidation channel.
    async fn publish_invalidation(&self, name: &str) -> StoreResult<()>;

    /// Open a long-lived subscription to the invalidation channel.
    async fn subscribe_invalidations(&self) -> StoreResult<Subscription>;

    // Counter operations used by the metrics pipeline.

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64>;

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;
}

/// Durable relational tier: one row per flag, all attributes in a JSON
/// document.
#[async_trait]
pub trait DurableBackend: Send + Sync {
    async fn get(&self, name: &str, key: &str) -> StoreResult<Option<String>>;

    async fn get_fields(&self, name: &str) -> StoreResult<Option<BTreeMap<String, String>>>;

    async fn set(&self, name: &str, key: &str, value: &str) -> StoreResult<()>;

    async fn set_fields(&self, name: &str, fields: &BTreeMap<String, String>) -> StoreResult<()>;

    async fn delete(&self, name: &str) -> StoreResult<()>;

    async fn exists(&self, name: &str) -> StoreResult<bool>;

    async fn feature_names(&self) -> StoreResult<Vec<String>>;

    async fn clear(&self) -> StoreResult<()>;
}
