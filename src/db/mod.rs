pub mod schema;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;

use crate::config::StoreConfig;
use schema::{create_queue_store_sql, is_valid_store_name};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid store name: {0:?}")]
    InvalidStoreName(String),

    #[error("Store {store} is at version {current}, cannot open at version {requested}")]
    VersionDowngrade {
        store: String,
        current: u32,
        requested: u32,
    },
}

pub struct Database {
    pool: SqlitePool,
    name: String,
}

impl Database {
    /// Open (or create) the database described by `config` and make sure every
    /// configured store exists. Safe to call repeatedly against the same file.
    pub async fn open(config: &StoreConfig) -> Result<Self, DbError> {
        let pool = match config.db_path() {
            Some(db_path) => {
                if let Some(dir) = db_path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

                tracing::info!("Opening database at: {}", db_path.display());

                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect(&db_url)
                    .await?
            }
            None => {
                tracing::warn!(
                    "No data directory configured for {}, queue will not survive a restart",
                    config.name
                );
                Self::memory_pool().await?
            }
        };

        let db = Self::migrate(pool, &config.name).await?;
        db.ensure_stores(config).await?;

        tracing::info!("Database {} initialized successfully", config.name);
        Ok(db)
    }

    /// Fresh in-memory database with the fixed tables but no queue stores.
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = Self::memory_pool().await?;
        Self::migrate(pool, "memory").await
    }

    async fn memory_pool() -> Result<SqlitePool, DbError> {
        // Every connection to :memory: is its own database, so pin the pool to one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(pool)
    }

    async fn migrate(pool: SqlitePool, name: &str) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            name: name.to_string(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create any missing stores and record the schema version. Existing
    /// stores and their rows are left untouched.
    pub async fn ensure_stores(&self, config: &StoreConfig) -> Result<(), DbError> {
        let stores = config.all_stores();
        if let Some(bad) = stores.iter().find(|s| !is_valid_store_name(s)) {
            return Err(DbError::InvalidStoreName(bad.clone()));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for store in &stores {
            let current: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM store_meta WHERE store_name = ?")
                    .bind(store)
                    .fetch_optional(&mut *tx)
                    .await?;

            if let Some((current,)) = current {
                let current = current as u32;
                if current > config.version {
                    return Err(DbError::VersionDowngrade {
                        store: store.clone(),
                        current,
                        requested: config.version,
                    });
                }
                if current < config.version {
                    tracing::info!(
                        "Upgrading store {} from version {} to {}",
                        store,
                        current,
                        config.version
                    );
                }
            } else {
                tracing::debug!("Creating store {} at version {}", store, config.version);
            }

            for statement in create_queue_store_sql(store) {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }

            sqlx::query(
                r#"
                INSERT INTO store_meta (store_name, version, created_at)
                VALUES (?, ?, ?)
                ON CONFLICT(store_name) DO UPDATE SET version = excluded.version
                "#,
            )
            .bind(store)
            .bind(config.version as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn store_version(&self, store: &str) -> Result<Option<u32>, DbError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM store_meta WHERE store_name = ?")
                .bind(store)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v as u32))
    }

    pub async fn list_stores(&self) -> Result<Vec<String>, DbError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT store_name FROM store_meta ORDER BY created_at, store_name")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
