//! Database layer for tenant persistence.
//!
//! ```text
//! ┌──────────────┐
//! │ Orchestrator │  (lifecycle, account, donations)
//! └──────┬───────┘
//!        │  TenantRepository
//!        ↓
//! ┌──────────────┐
//! │ Repositories │  (db::handlers - PostgreSQL or in-memory)
//! └──────┬───────┘
//!        │
//!        ↓
//! ┌──────────────┐
//! │    Models    │  (db::models - tenant records)
//! └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`handlers`]: The [`handlers::TenantRepository`] trait and its implementations
//! - [`models`]: Tenant record structures, update requests and filters
//! - [`errors`]: Database-specific error types
//!
//! # Migrations
//!
//! Migrations live in `migrations/` and are embedded at build time:
//!
//! ```ignore
//! tenantctl::db::migrator().run(&pool).await?;
//! ```

pub mod errors;
pub mod handlers;
pub mod models;

use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::config::PoolSettings;

/// Embedded tenant schema migrations
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Connect to PostgreSQL with the configured pool limits
pub async fn create_pool(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await?;
    info!(max_connections = settings.max_connections, "Connected to database");
    Ok(pool)
}
