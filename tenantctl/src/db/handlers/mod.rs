//! Repository implementations for database access.
//!
//! The orchestrator talks to tenant storage only through [`TenantRepository`]:
//!
//! - [`PostgresTenants`]: the durable store, backed by a [`sqlx::PgPool`]
//! - [`InMemoryTenants`]: same semantics over a locked map, for tests and dry runs
//!
//! Every method is a single short transaction. Lifecycle transitions are guarded
//! updates that report whether they applied, so callers can treat a repeated
//! transition as a no-op rather than an error.
//!
//! ```ignore
//! use tenantctl::db::handlers::{PostgresTenants, TenantRepository};
//!
//! let tenants = PostgresTenants::new(pool.clone());
//! if let Some(tenant) = tenants.get_by_identifier("forum1.example.com", false).await? {
//!     tenants.mark_installed(&tenant.tag, chrono::Utc::now()).await?;
//! }
//! ```

pub mod in_memory;
pub mod repository;
pub mod tenants;

pub use in_memory::InMemoryTenants;
pub use repository::TenantRepository;
pub use tenants::PostgresTenants;

#[cfg(test)]
mod tests;
