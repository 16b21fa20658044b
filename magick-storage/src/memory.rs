//! In-memory Remote and Durable backends.
//!
//! Process-local stand-ins for the networked adapters, used by the test
//! suites and by embedded deployments that want the full registry and
//! invalidation machinery without external services. The pub/sub
//! channel loops back to in-process subscribers, so cross-registry
//! coherence can be exercised inside one test.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use magick_core::error::AdapterError;

use crate::traits::{DurableBackend, RemoteBackend, StoreResult, Subscription};

/// In-memory [`RemoteBackend`] with loop-back pub/sub.
pub struct MemoryRemote {
    hashes: Mutex<HashMap<String, BTreeMap<String, String>>>,
    counters: Mutex<BTreeMap<String, String>>,
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
    failing: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            hashes: Mutex::new(HashMap::new()),
            counters: Mutex::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every operation fails until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AdapterError::Remote("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn get(&self, name: &str, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        Ok(self
            .hashes
            .lock()
            .get(name)
            .and_then(|fields| fields.get(key).cloned()))
    }

    async fn get_fields(&self, name: &str) -> StoreResult<BTreeMap<String, String>> {
        self.check()?;
        Ok(self.hashes.lock().get(name).cloned().unwrap_or_default())
    }

    async fn set(&self, name: &str, key: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.hashes
            .lock()
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_fields(&self, name: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        self.check()?;
        self.hashes.lock().insert(name.to_string(), fields.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.check()?;
        self.hashes.lock().remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.hashes.lock().contains_key(name))
    }

    async fn feature_names(&self) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self.hashes.lock().keys().cloned().collect())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.check()?;
        self.hashes.lock().clear();
        Ok(())
    }

    async fn publish_invalidation(&self, name: &str) -> StoreResult<()> {
        self.check()?;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.try_send(name.to_string()).is_ok());
        Ok(())
    }

    async fn subscribe_invalidations(&self) -> StoreResult<Subscription> {
        self.check()?;
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers.lock().push(tx);
        Ok(Subscription::new(rx))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.check()?;
        let mut counters = self.counters.lock();
        let entry = counters.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let next = entry.parse::<i64>().unwrap_or(0) + delta;
        *entry = next.to_string();
        Ok(next)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64> {
        self.check()?;
        let mut counters = self.counters.lock();
        let entry = counters.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let next = entry.parse::<f64>().unwrap_or(0.0) + delta;
        *entry = next.to_string();
        Ok(next)
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        Ok(self.counters.lock().get(key).cloned())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self
            .counters
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<()> {
        self.check()?;
        Ok(())
    }
}

/// In-memory [`DurableBackend`].
pub struct MemoryDurable {
    rows: Mutex<HashMap<String, BTreeMap<String, String>>>,
    failing: AtomicBool,
}

impl MemoryDurable {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every operation fails until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AdapterError::Durable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryDurable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableBackend for MemoryDurable {
    async fn get(&self, name: &str, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .get(name)
            .and_then(|fields| fields.get(key).cloned()))
    }

    async fn get_fields(&self, name: &str) -> StoreResult<Option<BTreeMap<String, String>>> {
        self.check()?;
        Ok(self.rows.lock().get(name).cloned())
    }

    async fn set(&self, name: &str, key: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.rows
            .lock()
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_fields(&self, name: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        self.check()?;
        self.rows.lock().insert(name.to_string(), fields.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.check()?;
        self.rows.lock().remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.rows.lock().contains_key(name))
    }

    async fn feature_names(&self) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self.rows.lock().keys().cloned().collect())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.check()?;
        self.rows.lock().clear();
        Ok(())
    }
}
