use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Namespace holding [`crate::models::Record`] documents
pub const RECORDS: &str = "records";
/// Namespace holding [`crate::models::Event`] documents
pub const EVENTS: &str = "events";
/// Namespace holding [`crate::models::Media`] documents
pub const MEDIA: &str = "media";
/// Namespace holding delivery queue entries
pub const DELIVERY_QUEUE: &str = "delivery-queue";

const KEY_SEPARATOR: char = '_';

/// Flat string key-value storage underneath every document namespace.
///
/// Each call is atomic for the single key it touches; there is no
/// multi-key transaction.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Insert or overwrite
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Delete every key starting with `prefix`, returning the number removed
    async fn remove_prefix(&self, prefix: &str) -> StoreResult<u64>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// SQLite-backed key-value storage
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (and create if missing) the database at `config.url`
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        ensure_parent_dir(&config.url)?;

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(url = %config.url, "Connected to SQLite document store");

        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> StoreResult<()> {
        info!("Running document store migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Document store migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KeyValueBackend for SqliteBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM documents WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM documents WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        // substr() avoids LIKE wildcard escaping. Prefixes are ASCII, so char
        // and byte lengths agree.
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT key, value FROM documents
            WHERE substr(key, 1, ?1) = ?2
            ORDER BY key
            "#,
        )
        .bind(prefix.len() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn remove_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM documents WHERE substr(key, 1, ?1) = ?2")
            .bind(prefix.len() as i64)
            .bind(prefix)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// Process-local key-value storage
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn remove_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Row returned by [`DocumentStore::list`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRow {
    pub id: String,
    pub body: Option<Value>,
}

/// Result of a [`DocumentStore::put`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PutResult {
    pub id: String,
}

/// A namespace of JSON documents stored under `<namespace>_<id>` keys.
///
/// Writes are last-write-wins with no version token; callers that care about
/// staleness re-read before mutating.
#[derive(Clone)]
pub struct DocumentStore {
    namespace: String,
    prefix: String,
    backend: Arc<dyn KeyValueBackend>,
}

impl DocumentStore {
    /// Namespaces are restricted to ASCII letters, digits and `-`, so one
    /// namespace's prefix can never match another namespace's keys.
    pub fn new(
        namespace: impl Into<String>,
        backend: Arc<dyn KeyValueBackend>,
    ) -> StoreResult<Self> {
        let namespace = namespace.into();
        let valid = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(StoreError::InvalidNamespace(namespace));
        }

        let prefix = format!("{}{}", namespace, KEY_SEPARATOR);
        Ok(Self {
            namespace,
            prefix,
            backend,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Enumerate the namespace. Rows whose value is not valid JSON are skipped.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn list(&self, include_body: bool) -> StoreResult<Vec<DocumentRow>> {
        let entries = self.backend.scan_prefix(&self.prefix).await?;
        let mut rows = Vec::with_capacity(entries.len());

        for (key, raw) in entries {
            let id = key[self.prefix.len()..].to_string();
            match serde_json::from_str::<Value>(&raw) {
                Ok(body) => rows.push(DocumentRow {
                    id,
                    body: include_body.then_some(body),
                }),
                Err(e) => {
                    warn!(
                        namespace = %self.namespace,
                        id = %id,
                        error = %e,
                        "Skipping unreadable document"
                    );
                }
            }
        }

        Ok(rows)
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<Value>> {
        match self.backend.get(&self.key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store a JSON object, assigning an `id` when it has none
    pub async fn put(&self, mut doc: Value) -> StoreResult<PutResult> {
        let object = doc.as_object_mut().ok_or_else(|| {
            StoreError::Serialization(serde::de::Error::custom("document must be a JSON object"))
        })?;

        let id = match object.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = format!("doc_{}", Uuid::new_v4().simple());
                object.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let raw = serde_json::to_string(&doc)?;
        self.backend.set(&self.key(&id), &raw).await?;

        debug!(namespace = %self.namespace, id = %id, "Document stored");
        Ok(PutResult { id })
    }

    pub async fn remove(&self, id: &str) -> StoreResult<()> {
        self.backend.remove(&self.key(id)).await
    }

    /// Wipe every document in this namespace
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn destroy(&self) -> StoreResult<u64> {
        let removed = self.backend.remove_prefix(&self.prefix).await?;
        info!(namespace = %self.namespace, removed = removed, "Namespace destroyed");
        Ok(removed)
    }

    pub async fn get_as<T: DeserializeOwned>(&self, id: &str) -> StoreResult<Option<T>> {
        match self.get(id).await? {
            Some(body) => Ok(Some(serde_json::from_value(body)?)),
            None => Ok(None),
        }
    }

    pub async fn put_as<T: Serialize>(&self, doc: &T) -> StoreResult<PutResult> {
        self.put(serde_json::to_value(doc)?).await
    }

    /// Every document that decodes as `T`; others are skipped with a warning
    pub async fn list_as<T: DeserializeOwned>(&self) -> StoreResult<Vec<T>> {
        let rows = self.list(true).await?;
        let mut docs = Vec::with_capacity(rows.len());

        for row in rows {
            let Some(body) = row.body else { continue };
            match serde_json::from_value(body) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    warn!(
                        namespace = %self.namespace,
                        id = %row.id,
                        error = %e,
                        "Skipping document with unexpected shape"
                    );
                }
            }
        }

        Ok(docs)
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        self.backend.health_check().await
    }
}

/// The namespaces used by the service, sharing one backend
#[derive(Clone)]
pub struct Stores {
    pub records: Arc<DocumentStore>,
    pub events: Arc<DocumentStore>,
    pub media: Arc<DocumentStore>,
    pub queue: Arc<DocumentStore>,
}

impl Stores {
    pub fn open(backend: Arc<dyn KeyValueBackend>) -> StoreResult<Self> {
        Ok(Self {
            records: Arc::new(DocumentStore::new(RECORDS, backend.clone())?),
            events: Arc::new(DocumentStore::new(EVENTS, backend.clone())?),
            media: Arc::new(DocumentStore::new(MEDIA, backend.clone())?),
            queue: Arc::new(DocumentStore::new(DELIVERY_QUEUE, backend)?),
        })
    }

    /// All namespaces over a fresh [`MemoryBackend`]
    pub fn in_memory() -> StoreResult<Self> {
        Self::open(Arc::new(MemoryBackend::new()))
    }
}

fn ensure_parent_dir(url: &str) -> StoreResult<()> {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }

    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
    }

    Ok(())
}
