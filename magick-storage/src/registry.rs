//! Tiered storage registry.
//!
//! Composes the Local, Remote, and Durable tiers. Writes go to every
//! configured tier; reads fall through Local → Remote → Durable, and a
//! hit on a lower tier backfills Local only. Every successful write
//! publishes the flag name on the invalidation channel so other
//! processes drop their Local copy.
//!
//! Remote writes ride the circuit breaker and degrade silently; the
//! Durable tier stays authoritative and its failures propagate. With
//! `async_updates` the Remote write is dispatched on a background task
//! while Local, Durable, and the publish stay on the caller's path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use magick_core::config::EngineConfig;

use crate::breaker::CircuitBreaker;
use crate::durable::DurableStore;
use crate::local::LocalStore;
use crate::remote::RedisStore;
use crate::traits::{DurableBackend, RemoteBackend, StoreResult};

/// The three-tier storage registry.
pub struct StoreRegistry {
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn RemoteBackend>>,
    durable: Option<Arc<dyn DurableBackend>>,
    breaker: Arc<CircuitBreaker>,
    async_updates: bool,
}

impl StoreRegistry {
    /// Memory-only registry: just the Local tier.
    pub fn new(memory_ttl: Duration, breaker: CircuitBreaker) -> Self {
        Self {
            local: Arc::new(LocalStore::with_ttl(memory_ttl)),
            remote: None,
            durable: None,
            breaker: Arc::new(breaker),
            async_updates: false,
        }
    }

    /// Build the registry from configuration, connecting the Remote and
    /// Durable adapters that are configured.
    pub async fn from_config(config: &EngineConfig) -> StoreResult<Self> {
        let mut registry = Self::new(
            config.memory_ttl,
            CircuitBreaker::new(config.circuit_breaker.clone()),
        )
        .with_async_updates(config.async_updates);

        if let Some(redis) = &config.redis {
            let store = RedisStore::new(redis.clone()).await?;
            registry = registry.with_remote(Arc::new(store));
        }
        if let Some(database) = &config.database {
            let store = DurableStore::new(database.clone()).await?;
            registry = registry.with_durable(Arc::new(store));
        }

        Ok(registry)
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_durable(mut self, durable: Arc<dyn DurableBackend>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_async_updates(mut self, enabled: bool) -> Self {
        self.async_updates = enabled;
        self
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteBackend>> {
        self.remote.as_ref()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Read one attribute, falling through the tiers. A hit below Local
    /// backfills Local only.
    pub async fn get(&self, name: &str, key: &str) -> StoreResult<Option<String>> {
        if let Some(value) = self.local.get(name, key) {
            return Ok(Some(value));
        }

        if let Some(remote) = &self.remote {
            match remote.get(name, key).await {
                Ok(Some(value)) => {
                    self.local.set(name, key, &value);
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(flag = %name, error = %err, "remote read failed, falling through");
                }
            }
        }

        if let Some(durable) = &self.durable {
            if let Some(value) = durable.get(name, key).await? {
                self.local.set(name, key, &value);
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    /// Read a flag's whole field map through the tiers.
    pub async fn get_fields(&self, name: &str) -> StoreResult<Option<BTreeMap<String, String>>> {
        if let Some(fields) = self.local.get_fields(name) {
            return Ok(Some(fields));
        }
        self.refresh_fields(name).await
    }

    /// Read a flag's field map from Remote → Durable, bypassing Local,
    /// and warm Local with the result. Used by the invalidation
    /// listener and by `reload`.
    pub async fn refresh_fields(&self, name: &str) -> StoreResult<Option<BTreeMap<String, String>>> {
        if let Some(remote) = &self.remote {
            match remote.get_fields(name).await {
                Ok(fields) if !fields.is_empty() => {
                    self.local.set_fields(name, fields.clone());
                    return Ok(Some(fields));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(flag = %name, error = %err, "remote read failed, falling through");
                }
            }
        }

        if let Some(durable) = &self.durable {
            if let Some(fields) = durable.get_fields(name).await? {
                self.local.set_fields(name, fields.clone());
                return Ok(Some(fields));
            }
        }

        Ok(None)
    }

    /// Write one attribute to every configured tier and publish the
    /// invalidation.
    pub async fn set(&self, name: &str, key: &str, value: &str) -> StoreResult<()> {
        self.local.set(name, key, value);

        if let Some(durable) = &self.durable {
            durable.set(name, key, value).await?;
        }

        if let Some(remote) = &self.remote {
            let remote = Arc::clone(remote);
            let breaker = Arc::clone(&self.breaker);
            let (name, key, value) = (name.to_string(), key.to_string(), value.to_string());
            let write = async move {
                breaker
                    .call(|| async { remote.set(&name, &key, &value).await })
                    .await;
            };
            if self.async_updates {
                tokio::spawn(write);
            } else {
                write.await;
            }
        }

        self.publish(name).await;
        Ok(())
    }

    /// Write a flag's whole field map to every configured tier and
    /// publish the invalidation.
    pub async fn set_fields(&self, name: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        self.local.set_fields(name, fields.clone());

        if let Some(durable) = &self.durable {
            durable.set_fields(name, fields).await?;
        }

        if let Some(remote) = &self.remote {
            let remote = Arc::clone(remote);
            let breaker = Arc::clone(&self.breaker);
            let name = name.to_string();
            let fields = fields.clone();
            let write = async move {
                breaker
                    .call(|| async { remote.set_fields(&name, &fields).await })
                    .await;
            };
            if self.async_updates {
                tokio::spawn(write);
            } else {
                write.await;
            }
        }

        self.publish(name).await;
        Ok(())
    }

    /// Remove a flag from every tier and publish the invalidation.
    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        self.local.delete(name);

        if let Some(durable) = &self.durable {
            durable.delete(name).await?;
        }

        if let Some(remote) = &self.remote {
            let remote = Arc::clone(remote);
            let breaker = Arc::clone(&self.breaker);
            let name = name.to_string();
            let write = async move {
                breaker
                    .call(|| async { remote.delete(&name).await })
                    .await;
            };
            if self.async_updates {
                tokio::spawn(write);
            } else {
                write.await;
            }
        }

        self.publish(name).await;
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> StoreResult<bool> {
        if self.local.exists(name) {
            return Ok(true);
        }
        if let Some(remote) = &self.remote {
            match remote.exists(name).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) => warn!(flag = %name, error = %err, "remote exists failed"),
            }
        }
        if let Some(durable) = &self.durable {
            return durable.exists(name).await;
        }
        Ok(false)
    }

    /// Known flag names from the deepest reachable tier.
    pub async fn feature_names(&self) -> StoreResult<Vec<String>> {
        if let Some(remote) = &self.remote {
            match remote.feature_names().await {
                Ok(names) => return Ok(names),
                Err(err) => warn!(error = %err, "remote listing failed, falling through"),
            }
        }
        if let Some(durable) = &self.durable {
            return durable.feature_names().await;
        }
        Ok(self.local.feature_names())
    }

    /// Drop all flag state from every tier. Test support.
    pub async fn clear(&self) -> StoreResult<()> {
        self.local.clear();
        if let Some(durable) = &self.durable {
            durable.clear().await?;
        }
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.clear().await {
                warn!(error = %err, "remote clear failed");
            }
        }
        Ok(())
    }

    /// Drop a flag from the Local tier only. Used by the invalidation
    /// listener; no publish.
    pub fn evict_local(&self, name: &str) {
        self.local.delete(name);
    }

    async fn publish(&self, name: &str) {
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.publish_invalidation(name).await {
                warn!(flag = %name, error = %err, "invalidation publish failed");
            } else {
                debug!(flag = %name, "invalidation published");
            }
        }
    }
}
