//! Database record models matching table schemas.
//!
//! - [`tenants`]: Tenant records, lifecycle state, update requests and list filters
//! - [`stats`]: Usage snapshots collected from installed sites
//!
//! Models are plain structs; the row mapping lives next to the queries in
//! [`crate::db::handlers`] so the in-memory repository can share them.

pub mod stats;
pub mod tenants;
