//! Durable key/value configuration (one logical collection, one document per key).
//!
//! Backends: postgres (`postgres://`), a JSON file written atomically (`file://` or a bare path),
//! and an in-process map (`memory`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::RelayDb;

#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),
    #[error("unsupported config store url '{0}'")]
    UnsupportedUrl(String),
    #[error("config store is closed")]
    Closed,
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigStoreError>;

    /// Upsert; the last writer wins.
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigStoreError>;

    async fn close(&self) -> Result<(), ConfigStoreError>;

    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
    Postgres(String),
}

impl StoreLocation {
    pub fn parse(url: &str) -> Result<Self, ConfigStoreError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(ConfigStoreError::UnsupportedUrl(url.to_string()));
        }
        if trimmed.eq_ignore_ascii_case("memory") {
            return Ok(Self::Memory);
        }
        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            return Ok(Self::Postgres(trimmed.to_string()));
        }
        if let Some(path) = trimmed.strip_prefix("file://") {
            if path.is_empty() {
                return Err(ConfigStoreError::UnsupportedUrl(url.to_string()));
            }
            return Ok(Self::File(PathBuf::from(path)));
        }
        if trimmed.contains("://") {
            return Err(ConfigStoreError::UnsupportedUrl(url.to_string()));
        }
        Ok(Self::File(PathBuf::from(trimmed)))
    }
}

/// Opens the backend named by `url`. Failures here are meant to abort startup.
pub async fn connect(url: &str, collection: &str) -> Result<Arc<dyn ConfigStore>, ConfigStoreError> {
    let collection = validate_collection(collection)?;
    match StoreLocation::parse(url)? {
        StoreLocation::Memory => Ok(memory()),
        StoreLocation::File(path) => file(path, collection).await,
        StoreLocation::Postgres(database_url) => {
            let db = RelayDb::connect(database_url.as_str())
                .await
                .map_err(|error| ConfigStoreError::Db(format!("{error:#}")))?;
            postgres(Arc::new(db), collection).await
        }
    }
}

pub fn memory() -> Arc<dyn ConfigStore> {
    Arc::new(MemoryConfigStore::default())
}

pub async fn file(
    path: PathBuf,
    collection: &str,
) -> Result<Arc<dyn ConfigStore>, ConfigStoreError> {
    let collection = validate_collection(collection)?.to_string();
    let document = load_document(&path).await?;
    Ok(Arc::new(FileConfigStore {
        path,
        collection,
        document: Mutex::new(document),
        closed: AtomicBool::new(false),
    }))
}

pub async fn postgres(
    db: Arc<RelayDb>,
    collection: &str,
) -> Result<Arc<dyn ConfigStore>, ConfigStoreError> {
    let table = validate_collection(collection)?.to_string();
    let store = PostgresConfigStore { db, table };
    store.ensure_table().await?;
    Ok(Arc::new(store))
}

/// Collection names double as SQL table names, so only plain identifiers are accepted.
pub fn validate_collection(collection: &str) -> Result<&str, ConfigStoreError> {
    let trimmed = collection.trim();
    let mut chars = trimmed.chars();
    let valid_start = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && trimmed.len() <= 63 {
        Ok(trimmed)
    } else {
        Err(ConfigStoreError::InvalidCollection(collection.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredValue {
    value: String,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryConfigStore {
    inner: Mutex<BTreeMap<String, StoredValue>>,
    closed: AtomicBool,
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConfigStoreError::Closed);
        }
        let inner = self.inner.lock().await;
        Ok(inner.get(key).map(|stored| stored.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConfigStoreError::Closed);
        }
        let mut inner = self.inner.lock().await;
        inner.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), ConfigStoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// `{ collection: { key: { value, updated_at } } }`
type FileDocument = BTreeMap<String, BTreeMap<String, StoredValue>>;

struct FileConfigStore {
    path: PathBuf,
    collection: String,
    document: Mutex<FileDocument>,
    closed: AtomicBool,
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConfigStoreError::Closed);
        }
        let document = self.document.lock().await;
        Ok(document
            .get(&self.collection)
            .and_then(|entries| entries.get(key))
            .map(|stored| stored.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConfigStoreError::Closed);
        }
        let mut document = self.document.lock().await;
        let mut next = document.clone();
        next.entry(self.collection.clone()).or_default().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
        persist_document(&self.path, &next).await?;
        *document = next;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConfigStoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

async fn load_document(path: &Path) -> Result<FileDocument, ConfigStoreError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(
                target: "interpreter_relay::config_store",
                path = %path.display(),
                "config store file not found; starting empty",
            );
            return Ok(FileDocument::default());
        }
        Err(error) => {
            return Err(ConfigStoreError::Persistence(format!(
                "failed to read config store {}: {error}",
                path.display()
            )));
        }
    };
    if raw.trim().is_empty() {
        return Ok(FileDocument::default());
    }
    serde_json::from_str::<FileDocument>(&raw).map_err(|error| {
        ConfigStoreError::Persistence(format!(
            "failed to parse config store {}: {error}",
            path.display()
        ))
    })
}

async fn persist_document(path: &Path, document: &FileDocument) -> Result<(), ConfigStoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|error| {
            ConfigStoreError::Persistence(format!(
                "failed to prepare config store directory: {error}"
            ))
        })?;
    }

    let payload = serde_json::to_vec_pretty(document).map_err(|error| {
        ConfigStoreError::Persistence(format!("failed to encode config store payload: {error}"))
    })?;
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

    tokio::fs::write(&temp_path, payload)
        .await
        .map_err(|error| {
            ConfigStoreError::Persistence(format!("failed to write config store payload: {error}"))
        })?;

    tokio::fs::rename(&temp_path, path).await.map_err(|error| {
        ConfigStoreError::Persistence(format!("failed to finalize config store payload: {error}"))
    })?;

    Ok(())
}

struct PostgresConfigStore {
    db: Arc<RelayDb>,
    table: String,
}

impl PostgresConfigStore {
    async fn ensure_table(&self) -> Result<(), ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .batch_execute(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )
                "#,
                table = self.table
            ))
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))
    }
}

#[async_trait]
impl ConfigStore for PostgresConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT value FROM {} WHERE key = $1", self.table),
                &[&key],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        Ok(row.map(|row| row.get::<_, String>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                &format!(
                    r#"
                    INSERT INTO {} (key, value, updated_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (key) DO UPDATE
                       SET value = EXCLUDED.value,
                           updated_at = EXCLUDED.updated_at
                    "#,
                    self.table
                ),
                &[&key, &value, &Utc::now()],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConfigStoreError> {
        self.db.close();
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
