pub mod groups;
pub mod messages;
pub mod models;
pub mod refresh_tokens;
mod schema;
pub mod users;

use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Handle to the Postgres store. Cheap to clone; every clone shares
/// the same connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database at `uri` and bring the schema up to
    /// date.
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(uri)
            .await?;

        schema::bootstrap(&pool).await?;

        info!("database ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool. Used by tests that manage their own
    /// schema.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
