//! Persistence adapters for the snapshot: flat file, sqlite or redis,
//! selected by `storage.type`. Every backend stores the snapshot as one JSON
//! document; readers tolerate an absent document.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::{StorageConfig, StorageKind};
use crate::snapshot::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError>;
    async fn load(&self) -> Result<Option<Snapshot>, StorageError>;
}

/// Open the backend named by the configuration. Failure here is fatal at
/// startup; the service refuses to run without a working adapter.
pub async fn open(cfg: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match cfg.kind {
        StorageKind::File => Ok(Arc::new(FileStorage::new(cfg.path.clone())?)),
        StorageKind::Sqlite => Ok(Arc::new(SqliteStorage::open(&cfg.path).await?)),
        StorageKind::Redis => Ok(Arc::new(RedisStorage::open(&cfg.path).await?)),
    }
}

/// JSON document on disk, replaced atomically via write-to-temp-then-rename.
pub struct FileStorage {
    path: String,
}

impl FileStorage {
    pub fn new(path: String) -> Result<Self, StorageError> {
        if let Some(dir) = Path::new(&path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(Self { path })
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp = format!("{}.tmp", self.path);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Single-row sqlite table holding the latest snapshot document.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS snapshots(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let data = serde_json::to_string(snapshot)?;
        let mut tx = self.pool.begin().await?;
        // Only the latest snapshot is kept.
        sqlx::query("DELETE FROM snapshots").execute(&mut *tx).await?;
        sqlx::query("INSERT INTO snapshots(data, updated_at) VALUES(?1, ?2)")
            .bind(&data)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT data FROM snapshots ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}

/// One redis key holding the snapshot document. `storage.path` is the
/// `host:port` of the server.
pub struct RedisStorage {
    client: redis::Client,
    key: String,
}

impl RedisStorage {
    pub async fn open(addr: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(format!("redis://{addr}"))?;
        let mut conn = client.get_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        info!("redis storage connected: {addr}");
        Ok(Self {
            client,
            key: "proxy_pool:snapshot".into(),
        })
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let data = serde_json::to_string(snapshot)?;
        let mut conn = self.client.get_async_connection().await?;
        conn.set::<_, _, ()>(&self.key, data).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let mut conn = self.client.get_async_connection().await?;
        let data: Option<String> = conn.get(&self.key).await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}
