//! Tenant repository trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::db::errors::Result;
use crate::db::models::stats::SiteStats;
use crate::db::models::tenants::{NewTenant, Tenant, TenantFilter, TenantUpdate};
use crate::jobs::JobFailure;

/// Constraint reported when an active tenant already holds a tag
pub const TAG_CONSTRAINT: &str = "tenants_pkey";
/// Constraint reported when an active tenant already uses a hostname
pub const HOSTNAME_CONSTRAINT: &str = "tenants_active_hostname_key";
/// Constraint reported for non-positive donation amounts
pub const DONATION_CONSTRAINT: &str = "tenants_donated_amount_non_negative";

/// Durable store of tenant records.
///
/// Soft-deleted (removed) rows stay visible to [`get`](Self::get) and to filters that ask for
/// them, but never hold a hostname or block a tag from being reclaimed through
/// [`insert`](Self::insert).
#[async_trait]
pub trait TenantRepository: Send + Sync {
    /// Fetch a tenant by tag, removed or not
    async fn get(&self, tag: &str) -> Result<Option<Tenant>>;

    /// Look a tenant up by tag, admin e-mail (case-insensitive) or hostname.
    ///
    /// A tag match wins over a hostname match, which wins over an e-mail match. Among several
    /// e-mail matches the most recently created tenant is returned. Removed tenants are only
    /// considered when `match_removed` is set, and then only after active ones.
    async fn get_by_identifier(&self, identifier: &str, match_removed: bool) -> Result<Option<Tenant>>;

    /// List tenants ordered by tag
    async fn list(&self, filter: &TenantFilter) -> Result<Vec<Tenant>>;

    /// Every tenant that is not removed
    async fn list_active(&self) -> Result<Vec<Tenant>> {
        self.list(&TenantFilter::active()).await
    }

    /// Insert a tenant in the provisioning state.
    ///
    /// A removed tenant holding the same tag is purged in the same transaction. An active
    /// holder makes the insert fail with a unique violation on [`TAG_CONSTRAINT`].
    async fn insert(&self, tenant: &NewTenant) -> Result<Tenant>;

    /// Apply a partial update to an active tenant
    async fn update(&self, tag: &str, update: &TenantUpdate) -> Result<Tenant>;

    /// Hard delete; only used to reclaim a tag
    async fn delete(&self, tag: &str) -> Result<bool>;

    /// Provisioning -> Installed. Returns false if the tenant was already installed, removed or
    /// does not exist.
    async fn mark_installed(&self, tag: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Provisioning -> Failed, recording the job failure. Returns false if not provisioning.
    async fn mark_failed(&self, tag: &str, failure: &JobFailure, at: DateTime<Utc>) -> Result<bool>;

    /// Failed -> Provisioning, ahead of a retry. Returns false if not failed.
    async fn clear_failure(&self, tag: &str) -> Result<bool>;

    /// Flip to Removed. Returns false if already removed or missing.
    async fn mark_removed(&self, tag: &str, reason: &str, ip: Option<&str>, at: DateTime<Utc>) -> Result<bool>;

    /// Add a positive amount to the donation total and return the new total
    async fn add_donation(&self, tag: &str, amount: Decimal) -> Result<Decimal>;

    /// Tenants still provisioning whose record has not changed since `updated_before`
    async fn list_stale_provisioning(&self, updated_before: DateTime<Utc>) -> Result<Vec<Tenant>>;

    /// Append a usage snapshot for an existing tenant
    async fn record_stats(&self, stats: &SiteStats) -> Result<()>;

    /// The most recent snapshot of every tenant that has one, keyed by tag
    async fn latest_stats(&self) -> Result<HashMap<String, SiteStats>>;
}
