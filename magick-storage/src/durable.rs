//! SQL-backed Durable store.
//!
//! One row per flag in `magick_features(id, feature_name UNIQUE, data,
//! created_at, updated_at)`, with every attribute in the `data` JSON
//! document. SQLite, Postgres, and MySQL are supported through one
//! `sqlx::Any` pool; Postgres gets a native JSONB column. Writes retry
//! with short backoff on busy/locked/timeout errors.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use magick_core::config::DatabaseConfig;
use magick_core::error::AdapterError;

use crate::traits::{DurableBackend, StoreResult};

const MAX_RETRIES: u32 = 5;

fn durable_err(err: sqlx::Error) -> AdapterError {
    AdapterError::Durable(err.to_string())
}

/// Retry transient failures with linear backoff (10/20/30/40/50 ms).
async fn with_retry<T, F, Fut>(mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                debug!(attempt, error = %err, "retrying durable operation");
                tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbKind {
    Sqlite,
    Postgres,
    MySql,
}

impl DbKind {
    fn from_url(url: &str) -> Self {
        if url.starts_with("postgres") {
            Self::Postgres
        } else if url.starts_with("mysql") {
            Self::MySql
        } else {
            Self::Sqlite
        }
    }
}

/// Durable store over a relational database.
pub struct DurableStore {
    pool: AnyPool,
    kind: DbKind,
    table_ready: OnceCell<()>,
}

impl DurableStore {
    /// Connect a pool. The table is created lazily on first use.
    pub async fn new(config: DatabaseConfig) -> StoreResult<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .map_err(durable_err)?;

        info!(url = %config.url, "durable store connected");

        Ok(Self {
            pool,
            kind: DbKind::from_url(&config.url),
            table_ready: OnceCell::new(),
        })
    }

    /// Idempotent table creation, run once per store.
    async fn ensure_table(&self) -> StoreResult<()> {
        self.table_ready
            .get_or_try_init(|| async {
                let ddl = match self.kind {
                    DbKind::Sqlite => {
                        "CREATE TABLE IF NOT EXISTS magick_features (\
                         id INTEGER PRIMARY KEY AUTOINCREMENT, \
                         feature_name TEXT NOT NULL UNIQUE, \
                         data TEXT NOT NULL, \
                         created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                         updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
                    }
                    DbKind::Postgres => {
                        "CREATE TABLE IF NOT EXISTS magick_features (\
                         id BIGSERIAL PRIMARY KEY, \
                         feature_name TEXT NOT NULL UNIQUE, \
                         data JSONB NOT NULL, \
                         created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                         updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())"
                    }
                    DbKind::MySql => {
                        "CREATE TABLE IF NOT EXISTS magick_features (\
                         id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                         feature_name VARCHAR(255) NOT NULL UNIQUE, \
                         data JSON NOT NULL, \
                         created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                         updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
                    }
                };
                with_retry(|| async {
                    sqlx::query(ddl)
                        .execute(&self.pool)
                        .await
                        .map_err(durable_err)?;
                    Ok(())
                })
                .await
            })
            .await
            .map(|_| ())
    }

    fn select_data_sql(&self) -> &'static str {
        match self.kind {
            DbKind::Postgres => "SELECT data::text FROM magick_features WHERE feature_name = $1",
            _ => "SELECT data FROM magick_features WHERE feature_name = ?",
        }
    }

    fn insert_sql(&self) -> &'static str {
        match self.kind {
            DbKind::Postgres => {
                "INSERT INTO magick_features (feature_name, data) VALUES ($1, $2::jsonb)"
            }
            _ => "INSERT INTO magick_features (feature_name, data) VALUES (?, ?)",
        }
    }

    fn update_sql(&self) -> &'static str {
        match self.kind {
            DbKind::Postgres => {
                "UPDATE magick_features SET data = $1::jsonb, updated_at = NOW() \
                 WHERE feature_name = $2"
            }
            _ => {
                "UPDATE magick_features SET data = ?, updated_at = CURRENT_TIMESTAMP \
                 WHERE feature_name = ?"
            }
        }
    }

    fn delete_sql(&self) -> &'static str {
        match self.kind {
            DbKind::Postgres => "DELETE FROM magick_features WHERE feature_name = $1",
            _ => "DELETE FROM magick_features WHERE feature_name = ?",
        }
    }

    async fn load_data(&self, name: &str) -> StoreResult<Option<String>> {
        with_retry(|| async {
            sqlx::query_scalar::<_, String>(self.select_data_sql())
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(durable_err)
        })
        .await
    }

    /// Write the whole JSON document, updating the row if it exists.
    async fn store_data(&self, name: &str, data: &str) -> StoreResult<()> {
        let updated = with_retry(|| async {
            sqlx::query(self.update_sql())
                .bind(data)
                .bind(name)
                .execute(&self.pool)
                .await
                .map(|result| result.rows_affected())
                .map_err(durable_err)
        })
        .await?;

        if updated == 0 {
            with_retry(|| async {
                sqlx::query(self.insert_sql())
                    .bind(name)
                    .bind(data)
                    .execute(&self.pool)
                    .await
                    .map(|_| ())
                    .map_err(durable_err)
            })
            .await?;
        }
        Ok(())
    }

    fn parse_fields(raw: &str) -> StoreResult<BTreeMap<String, String>> {
        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(raw).map_err(AdapterError::from)?;
        Ok(object
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect())
    }

    fn encode_fields(fields: &BTreeMap<String, String>) -> StoreResult<String> {
        let object: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::to_string(&serde_json::Value::Object(object)).map_err(AdapterError::from)
    }
}

#[async_trait]
impl DurableBackend for DurableStore {
    async fn get(&self, name: &str, key: &str) -> StoreResult<Option<String>> {
        self.ensure_table().await?;
        match self.load_data(name).await? {
            Some(raw) => Ok(Self::parse_fields(&raw)?.remove(key)),
            None => Ok(None),
        }
    }

    async fn get_fields(&self, name: &str) -> StoreResult<Option<BTreeMap<String, String>>> {
        self.ensure_table().await?;
        match self.load_data(name).await? {
            Some(raw) => Ok(Some(Self::parse_fields(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, name: &str, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_table().await?;
        let mut fields = match self.load_data(name).await? {
            Some(raw) => Self::parse_fields(&raw)?,
            None => BTreeMap::new(),
        };
        fields.insert(key.to_string(), value.to_string());
        self.store_data(name, &Self::encode_fields(&fields)?).await
    }

    async fn set_fields(&self, name: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        self.ensure_table().await?;
        self.store_data(name, &Self::encode_fields(fields)?).await
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.ensure_table().await?;
        with_retry(|| async {
            sqlx::query(self.delete_sql())
                .bind(name)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(durable_err)
        })
        .await
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        self.ensure_table().await?;
        Ok(self.load_data(name).await?.is_some())
    }

    async fn feature_names(&self) -> StoreResult<Vec<String>> {
        self.ensure_table().await?;
        with_retry(|| async {
            sqlx::query_scalar::<_, String>("SELECT feature_name FROM magick_features")
                .fetch_all(&self.pool)
                .await
                .map_err(durable_err)
        })
        .await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.ensure_table().await?;
        with_retry(|| async {
            sqlx::query("DELETE FROM magick_features")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(durable_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> DurableStore {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        };
        DurableStore::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get_round_trip() {
        let store = memory_store().await;

        let fields: BTreeMap<String, String> = [
            ("type".to_string(), "boolean".to_string()),
            ("value".to_string(), "true".to_string()),
        ]
        .into();
        store.set_fields("dark_mode", &fields).await.unwrap();

        assert_eq!(
            store.get("dark_mode", "value").await.unwrap(),
            Some("true".to_string())
        );
        assert_eq!(store.get_fields("dark_mode").await.unwrap(), Some(fields));
        assert!(store.exists("dark_mode").await.unwrap());
    }

    #[tokio::test]
    async fn test_attribute_update_preserves_siblings() {
        let store = memory_store().await;
        store.set("f", "type", "string").await.unwrap();
        store.set("f", "value", "v1").await.unwrap();
        store.set("f", "value", "v2").await.unwrap();

        let fields = store.get_fields("f").await.unwrap().unwrap();
        assert_eq!(fields.get("type").map(String::as_str), Some("string"));
        assert_eq!(fields.get("value").map(String::as_str), Some("v2"));
    }

    #[tokio::test]
    async fn test_delete_and_names() {
        let store = memory_store().await;
        store.set("a", "type", "boolean").await.unwrap();
        store.set("b", "type", "boolean").await.unwrap();

        let mut names = store.feature_names().await.unwrap();
        names.sort();
        assert_eq!(names, ["a", "b"]);

        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());

        store.clear().await.unwrap();
        assert!(store.feature_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_flag_reads_as_none() {
        let store = memory_store().await;
        assert_eq!(store.get("ghost", "value").await.unwrap(), None);
        assert_eq!(store.get_fields("ghost").await.unwrap(), None);
        assert!(!store.exists("ghost").await.unwrap());
    }
}
