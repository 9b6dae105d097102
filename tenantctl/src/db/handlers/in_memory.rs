//! In-memory tenant repository.
//!
//! Keeps every tenant in a map behind a lock and applies the same guards and uniqueness rules
//! as the PostgreSQL repository, including the constraint names it reports. Suitable for tests
//! and dry runs; nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::repository::{DONATION_CONSTRAINT, HOSTNAME_CONSTRAINT, TAG_CONSTRAINT, TenantRepository};
use crate::db::errors::{DbError, Result};
use crate::db::models::stats::SiteStats;
use crate::db::models::tenants::{NewTenant, Tenant, TenantFilter, TenantUpdate};
use crate::jobs::JobFailure;

/// In-memory implementation of [`TenantRepository`].
///
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct InMemoryTenants {
    tenants: Arc<RwLock<BTreeMap<String, Tenant>>>,
    stats: Arc<RwLock<Vec<SiteStats>>>,
}

impl InMemoryTenants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record directly, bypassing every guard
    pub fn put(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.tag.clone(), tenant);
    }

    fn unique_violation(constraint: &str, message: String) -> DbError {
        DbError::UniqueViolation {
            constraint: Some(constraint.to_string()),
            table: Some("tenants".to_string()),
            message,
        }
    }

    fn hostname_taken(tenants: &BTreeMap<String, Tenant>, hostname: &str, except_tag: &str) -> bool {
        tenants
            .values()
            .any(|t| !t.is_removed() && t.tag != except_tag && t.hostname == hostname)
    }

    /// Apply `f` to the tenant if `guard` holds; reports whether it did
    fn transition(&self, tag: &str, guard: impl Fn(&Tenant) -> bool, f: impl FnOnce(&mut Tenant)) -> bool {
        let mut tenants = self.tenants.write();
        match tenants.get_mut(tag) {
            Some(tenant) if guard(tenant) => {
                f(tenant);
                tenant.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl TenantRepository for InMemoryTenants {
    async fn get(&self, tag: &str) -> Result<Option<Tenant>> {
        Ok(self.tenants.read().get(tag).cloned())
    }

    async fn get_by_identifier(&self, identifier: &str, match_removed: bool) -> Result<Option<Tenant>> {
        let lowered = identifier.to_lowercase();
        let rank = |t: &Tenant| -> Option<u8> {
            if t.tag == identifier {
                Some(0)
            } else if t.hostname == lowered {
                Some(1)
            } else if t.admin_email.to_lowercase() == lowered {
                Some(2)
            } else {
                None
            }
        };

        let tenants = self.tenants.read();
        let best = tenants
            .values()
            .filter(|t| match_removed || !t.is_removed())
            .filter_map(|t| rank(t).map(|r| (t.is_removed(), r, std::cmp::Reverse(t.created_at), t)))
            .min_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)))
            .map(|(_, _, _, t)| t.clone());
        Ok(best)
    }

    async fn list(&self, filter: &TenantFilter) -> Result<Vec<Tenant>> {
        let skip = usize::try_from(filter.skip).unwrap_or(0);
        let limit = filter.limit.map(|l| usize::try_from(l).unwrap_or(0)).unwrap_or(usize::MAX);
        Ok(self
            .tenants
            .read()
            .values()
            .filter(|t| filter.matches(t))
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert(&self, new: &NewTenant) -> Result<Tenant> {
        let mut tenants = self.tenants.write();

        if let Some(existing) = tenants.get(&new.tag) {
            if !existing.is_removed() {
                return Err(Self::unique_violation(
                    TAG_CONSTRAINT,
                    format!("duplicate key value violates unique constraint \"{TAG_CONSTRAINT}\""),
                ));
            }
        }
        if Self::hostname_taken(&tenants, &new.hostname, &new.tag) {
            return Err(Self::unique_violation(
                HOSTNAME_CONSTRAINT,
                format!("duplicate key value violates unique constraint \"{HOSTNAME_CONSTRAINT}\""),
            ));
        }

        let now = Utc::now();
        let tenant = Tenant {
            tag: new.tag.clone(),
            service_type: new.service_type,
            hostname: new.hostname.clone(),
            admin_email: new.admin_email.clone(),
            admin_password_hash: new.admin_password_hash.clone(),
            created_at: now,
            updated_at: now,
            installed_at: None,
            failed_at: None,
            failure: None,
            removed_at: None,
            removal_reason: None,
            removed_ip: None,
            created_ip: new.created_ip.clone(),
            last_login_at: None,
            last_login_ip: None,
            donated_amount: Decimal::ZERO,
        };
        // Replaces (purges) a removed holder of the tag, history included.
        if tenants.insert(tenant.tag.clone(), tenant.clone()).is_some() {
            self.stats.write().retain(|s| s.tag != tenant.tag);
        }
        Ok(tenant)
    }

    async fn update(&self, tag: &str, update: &TenantUpdate) -> Result<Tenant> {
        let mut tenants = self.tenants.write();

        if let Some(hostname) = &update.hostname
            && Self::hostname_taken(&tenants, hostname, tag)
        {
            return Err(Self::unique_violation(
                HOSTNAME_CONSTRAINT,
                format!("duplicate key value violates unique constraint \"{HOSTNAME_CONSTRAINT}\""),
            ));
        }

        let tenant = tenants
            .get_mut(tag)
            .filter(|t| !t.is_removed())
            .ok_or(DbError::NotFound)?;

        if let Some(hostname) = &update.hostname {
            tenant.hostname = hostname.clone();
        }
        if let Some(email) = &update.admin_email {
            tenant.admin_email = email.clone();
        }
        if let Some(hash) = &update.admin_password_hash {
            tenant.admin_password_hash = hash.clone();
        }
        if let Some((at, ip)) = &update.last_login {
            tenant.last_login_at = Some(*at);
            tenant.last_login_ip = ip.clone();
        }
        tenant.updated_at = Utc::now();
        Ok(tenant.clone())
    }

    async fn delete(&self, tag: &str) -> Result<bool> {
        let deleted = self.tenants.write().remove(tag).is_some();
        if deleted {
            self.stats.write().retain(|s| s.tag != tag);
        }
        Ok(deleted)
    }

    async fn mark_installed(&self, tag: &str, at: DateTime<Utc>) -> Result<bool> {
        Ok(self.transition(
            tag,
            |t| !t.is_installed() && !t.is_removed(),
            |t| {
                t.installed_at = Some(at);
                t.failed_at = None;
                t.failure = None;
            },
        ))
    }

    async fn mark_failed(&self, tag: &str, failure: &JobFailure, at: DateTime<Utc>) -> Result<bool> {
        Ok(self.transition(
            tag,
            |t| !t.is_installed() && !t.is_failed() && !t.is_removed(),
            |t| {
                t.failed_at = Some(at);
                t.failure = Some(failure.clone());
            },
        ))
    }

    async fn clear_failure(&self, tag: &str) -> Result<bool> {
        Ok(self.transition(
            tag,
            |t| t.is_failed() && !t.is_installed() && !t.is_removed(),
            |t| {
                t.failed_at = None;
                t.failure = None;
            },
        ))
    }

    async fn mark_removed(&self, tag: &str, reason: &str, ip: Option<&str>, at: DateTime<Utc>) -> Result<bool> {
        Ok(self.transition(
            tag,
            |t| !t.is_removed(),
            |t| {
                t.removed_at = Some(at);
                t.removal_reason = Some(reason.to_string());
                t.removed_ip = ip.map(str::to_string);
            },
        ))
    }

    async fn add_donation(&self, tag: &str, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(DbError::CheckViolation {
                constraint: Some(DONATION_CONSTRAINT.to_string()),
                table: Some("tenants".to_string()),
                message: format!("donation amount must be positive, got {amount}"),
            });
        }

        let mut tenants = self.tenants.write();
        let tenant = tenants
            .get_mut(tag)
            .filter(|t| !t.is_removed())
            .ok_or(DbError::NotFound)?;
        tenant.donated_amount += amount;
        tenant.updated_at = Utc::now();
        Ok(tenant.donated_amount)
    }

    async fn list_stale_provisioning(&self, updated_before: DateTime<Utc>) -> Result<Vec<Tenant>> {
        let mut stale: Vec<Tenant> = self
            .tenants
            .read()
            .values()
            .filter(|t| !t.is_installed() && !t.is_failed() && !t.is_removed() && t.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.updated_at);
        Ok(stale)
    }

    async fn record_stats(&self, stats: &SiteStats) -> Result<()> {
        if !self.tenants.read().contains_key(&stats.tag) {
            return Err(DbError::NotFound);
        }
        self.stats.write().push(stats.clone());
        Ok(())
    }

    async fn latest_stats(&self) -> Result<HashMap<String, SiteStats>> {
        let mut latest: HashMap<String, SiteStats> = HashMap::new();
        // Later pushes win ties, like the id tiebreak in SQL.
        for stats in self.stats.read().iter() {
            match latest.get(&stats.tag) {
                Some(seen) if seen.collected_at > stats.collected_at => {}
                _ => {
                    latest.insert(stats.tag.clone(), stats.clone());
                }
            }
        }
        Ok(latest)
    }
}
