//! SQLite key store (sqlx).
//!
//! Implements the `crb-core` KeyStore port over a bounded connection pool. Connections are
//! acquired per query and returned to the pool when the query finishes.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

use crb_core::{
    config::Config,
    domain::{ApiKey, UserId},
    errors::Error,
    ports::KeyStore,
    Result,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Pool settings for [`SqliteKeyStore::connect`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub max_lifetime: Duration,
}

impl StoreOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.database_max_connections,
            acquire_timeout: cfg.database_acquire_timeout,
            max_lifetime: cfg.database_max_lifetime,
        }
    }
}

#[derive(Clone)]
pub struct SqliteKeyStore {
    pool: SqlitePool,
}

impl SqliteKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the pool (creating the database file if needed) and run migrations.
    pub async fn connect(opts: &StoreOptions) -> Result<Self> {
        let connect = SqliteConnectOptions::from_str(&opts.url)
            .map_err(|e| Error::Config(format!("invalid DATABASE_URL {:?}: {e}", opts.url)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(opts.max_connections.max(1))
            .acquire_timeout(opts.acquire_timeout)
            .max_lifetime(opts.max_lifetime)
            .connect_with(connect)
            .await
            .map_err(|e| store_err("connect", e))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| Error::Store(format!("migrate: {e}")))?;

        info!(max_connections = opts.max_connections, "key store ready");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn store_err(operation: &str, e: sqlx::Error) -> Error {
    Error::Store(format!("{operation}: {e}"))
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn find_key(&self, user_id: UserId) -> Result<Option<ApiKey>> {
        let key = sqlx::query_scalar::<_, String>("SELECT api_key FROM users WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("find_key", e))?;

        Ok(key.map(ApiKey::new))
    }

    async fn upsert_key(&self, user_id: UserId, api_key: &ApiKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, api_key)
            VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET api_key = excluded.api_key
            "#,
        )
        .bind(user_id.0)
        .bind(api_key.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("upsert_key", e))?;

        Ok(())
    }
}
