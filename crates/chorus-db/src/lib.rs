//! # chorus-db
//!
//! Storage layer for the Chorus voice backend. Manages connections to:
//! - **PostgreSQL** — durable voice session accounting
//! - **Redis** — shared per-channel screen-share slot counters (TTL-backed)
//!
//! In-memory implementations of both stores are provided for single-process
//! deployments and tests; the traits they implement are the contracts the
//! voice crate programs against.

pub mod sessions;
pub mod slots;

use anyhow::Result;
use sqlx::PgPool;

/// Shared database state.
#[derive(Clone)]
pub struct Database {
    pub pg: PgPool,
    pub redis: redis::aio::ConnectionManager,
}

impl Database {
    /// Connect to all storage backends.
    pub async fn connect(config: &chorus_common::config::AppConfig) -> Result<Self> {
        tracing::info!("Connecting to PostgreSQL...");
        let pg = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .connect(&config.database.url)
            .await?;
        tracing::info!("Connected to PostgreSQL");

        tracing::info!("Connecting to Redis...");
        let redis_client = redis::Client::open(config.redis.url.as_str())?;
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        tracing::info!("Connected to Redis");

        Ok(Self { pg, redis })
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pg).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}
