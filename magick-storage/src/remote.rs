//! Redis-backed Remote store.
//!
//! Hash-per-flag layout: key `{namespace}:{flag_name}`, fields are
//! attribute names. Scalar values are stored as `"true"`/`"false"`,
//! numeric literals, or raw strings; composite values as JSON, the
//! encodings produced by `magick_core::FlagState`. The store also owns
//! the invalidation pub/sub channel and the counter keys the metrics
//! pipeline flushes into.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use magick_core::config::{RedisConfig, INVALIDATION_CHANNEL};
use magick_core::error::AdapterError;

use crate::traits::{RemoteBackend, StoreResult, Subscription};

fn remote_err(err: redis::RedisError) -> AdapterError {
    AdapterError::Remote(err.to_string())
}

/// Remote store over Redis.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    namespace: String,
}

impl RedisStore {
    /// Connect and verify the server responds.
    pub async fn new(config: RedisConfig) -> StoreResult<Self> {
        let client = Client::open(config.connection_url()).map_err(remote_err)?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(remote_err)?;

        let store = Self {
            client,
            connection,
            namespace: config.namespace,
        };
        store.health_check().await?;

        info!(namespace = %store.namespace, "remote store connected");
        Ok(store)
    }

    /// PING the server.
    pub async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(remote_err)?;
        Ok(())
    }

    fn hash_key(&self, name: &str) -> String {
        format!("{}:{}", self.namespace, name)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(remote_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl RemoteBackend for RedisStore {
    async fn get(&self, name: &str, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .hget(self.hash_key(name), key)
            .await
            .map_err(remote_err)?;
        Ok(value)
    }

    async fn get_fields(&self, name: &str) -> StoreResult<BTreeMap<String, String>> {
        let mut conn = self.connection.clone();
        let fields: BTreeMap<String, String> = conn
            .hgetall(self.hash_key(name))
            .await
            .map_err(remote_err)?;
        Ok(fields)
    }

    async fn set(&self, name: &str, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .hset(self.hash_key(name), key, value)
            .await
            .map_err(remote_err)?;
        Ok(())
    }

    async fn set_fields(&self, name: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        // Replace the whole hash so removed attributes do not linger.
        let key = self.hash_key(name);
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .hset_multiple(&key, &pairs)
            .query_async(&mut conn)
            .await
            .map_err(remote_err)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.hash_key(name)).await.map_err(remote_err)?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn
            .exists(self.hash_key(name))
            .await
            .map_err(remote_err)?;
        Ok(exists)
    }

    async fn feature_names(&self) -> StoreResult<Vec<String>> {
        let prefix = format!("{}:", self.namespace);
        let keys = self.scan(&format!("{prefix}*")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn clear(&self) -> StoreResult<()> {
        let keys = self.scan(&format!("{}:*", self.namespace)).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = conn.del(keys).await.map_err(remote_err)?;
        Ok(())
    }

    async fn publish_invalidation(&self, name: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let receivers: u32 = redis::cmd("PUBLISH")
            .arg(INVALIDATION_CHANNEL)
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(remote_err)?;
        debug!(flag = %name, receivers, "published invalidation");
        Ok(())
    }

    async fn subscribe_invalidations(&self) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(remote_err)?;
        pubsub
            .subscribe(INVALIDATION_CHANNEL)
            .await
            .map_err(remote_err)?;

        info!(channel = INVALIDATION_CHANNEL, "subscribed to invalidation channel");

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            while let Some(msg) = pubsub.on_message().next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(error = %err, "failed to read invalidation payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    debug!("invalidation subscriber dropped");
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(key, delta).await.map_err(remote_err)?;
        Ok(value)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64> {
        let mut conn = self.connection.clone();
        let value: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(remote_err)?;
        Ok(value)
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await.map_err(remote_err)?;
        Ok(value)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.scan(&format!("{prefix}*")).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: bool = conn
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(remote_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_hash_round_trip() {
        let config = RedisConfig::new("redis://localhost:6379");
        let store = RedisStore::new(config).await.unwrap();

        let fields: BTreeMap<String, String> = [
            ("type".to_string(), "boolean".to_string()),
            ("value".to_string(), "true".to_string()),
        ]
        .into();
        store.set_fields("it_flag", &fields).await.unwrap();

        assert_eq!(
            store.get("it_flag", "value").await.unwrap(),
            Some("true".to_string())
        );
        assert_eq!(store.get_fields("it_flag").await.unwrap(), fields);
        assert!(store.exists("it_flag").await.unwrap());

        store.delete("it_flag").await.unwrap();
        assert!(!store.exists("it_flag").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_invalidation_round_trip() {
        let config = RedisConfig::new("redis://localhost:6379");
        let store = RedisStore::new(config).await.unwrap();

        let mut sub = store.subscribe_invalidations().await.unwrap();
        store.publish_invalidation("it_flag").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        assert_eq!(received, Some("it_flag".to_string()));
    }
}
