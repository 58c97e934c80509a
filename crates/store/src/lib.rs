//! PostgreSQL persistence for the reconciliation engine.
//!
//! [`PgStore`] implements the position, transaction and user store traits of
//! `lendsync-core` over one connection pool. Amounts are stored as decimal
//! text and compared with `::numeric` casts, so full 256-bit values survive.

mod positions;
mod rows;
mod transactions;
mod users;

use anyhow::{Context, Result};
use lendsync_core::StoreError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Postgres error code for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;
        info!(max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Unique violations become [`StoreError::Conflict`]; everything else is a
/// backend failure.
pub(crate) fn store_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PgStore;
    use alloy::primitives::{Address, U160};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Connects to `DATABASE_URL` and applies migrations.
    pub async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::connect(&url, 2, Duration::from_secs(5)).await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    /// An address no earlier run has used.
    pub fn fresh_address() -> Address {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        Address::from(U160::from(nanos) << 32 | U160::from(n))
    }
}
