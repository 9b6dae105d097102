//! Database models for tenants.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::jobs::JobFailure;
use crate::types::{ServiceType, matching_parent_domain};

/// Lifecycle state, derived from the timestamps on the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantState {
    Provisioning,
    Installed,
    Failed,
    Removed,
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TenantState::Provisioning => "provisioning",
            TenantState::Installed => "installed",
            TenantState::Failed => "failed",
            TenantState::Removed => "removed",
        })
    }
}

/// A tenant record
#[derive(Clone, PartialEq, Serialize)]
pub struct Tenant {
    pub tag: String,
    pub service_type: ServiceType,
    pub hostname: String,
    pub admin_email: String,
    #[serde(skip_serializing)]
    pub admin_password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub installed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure: Option<JobFailure>,
    pub removed_at: Option<DateTime<Utc>>,
    pub removal_reason: Option<String>,
    pub removed_ip: Option<String>,
    pub created_ip: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub donated_amount: Decimal,
}

// Hand-written so the password hash never reaches a log line.
impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("tag", &self.tag)
            .field("service_type", &self.service_type)
            .field("hostname", &self.hostname)
            .field("admin_email", &self.admin_email)
            .field("admin_password_hash", &"<redacted>")
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .field("installed_at", &self.installed_at)
            .field("removed_at", &self.removed_at)
            .field("donated_amount", &self.donated_amount)
            .finish_non_exhaustive()
    }
}

impl Tenant {
    pub fn is_installed(&self) -> bool {
        self.installed_at.is_some()
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn state(&self) -> TenantState {
        if self.is_removed() {
            TenantState::Removed
        } else if self.is_installed() {
            TenantState::Installed
        } else if self.is_failed() {
            TenantState::Failed
        } else {
            TenantState::Provisioning
        }
    }

    pub fn is_donor(&self) -> bool {
        self.donated_amount > Decimal::ZERO
    }

    /// Donations reached the amount that unlocks custom domains
    pub fn has_donor_perks(&self, threshold: Decimal) -> bool {
        self.donated_amount >= threshold
    }

    /// Last two labels of the hostname
    pub fn parent_domain(&self) -> &str {
        let mut dots = self.hostname.rmatch_indices('.').map(|(i, _)| i);
        let _ = dots.next();
        match dots.next() {
            Some(i) => &self.hostname[i + 1..],
            None => &self.hostname,
        }
    }

    /// True unless the hostname sits under one of the platform's own domains
    pub fn uses_custom_domain(&self, allowed_domains: &[String]) -> bool {
        matching_parent_domain(&self.hostname, allowed_domains).is_none()
    }
}

/// Insert request for a new tenant; state starts as provisioning
#[derive(Clone)]
pub struct NewTenant {
    pub tag: String,
    pub service_type: ServiceType,
    pub hostname: String,
    pub admin_email: String,
    pub admin_password_hash: String,
    pub created_ip: Option<String>,
}

impl fmt::Debug for NewTenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewTenant")
            .field("tag", &self.tag)
            .field("service_type", &self.service_type)
            .field("hostname", &self.hostname)
            .field("admin_email", &self.admin_email)
            .finish_non_exhaustive()
    }
}

/// Partial update; `None` leaves a column untouched
#[derive(Clone, Default)]
pub struct TenantUpdate {
    pub hostname: Option<String>,
    pub admin_email: Option<String>,
    pub admin_password_hash: Option<String>,
    pub last_login: Option<(DateTime<Utc>, Option<String>)>,
}

impl fmt::Debug for TenantUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantUpdate")
            .field("hostname", &self.hostname)
            .field("admin_email", &self.admin_email)
            .field("admin_password_hash", &self.admin_password_hash.as_ref().map(|_| "<redacted>"))
            .field("last_login", &self.last_login)
            .finish()
    }
}

impl TenantUpdate {
    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    pub fn password_hash(hash: impl Into<String>) -> Self {
        Self {
            admin_password_hash: Some(hash.into()),
            ..Default::default()
        }
    }

    pub fn admin_email(email: impl Into<String>) -> Self {
        Self {
            admin_email: Some(email.into()),
            ..Default::default()
        }
    }

    pub fn login(at: DateTime<Utc>, ip: Option<String>) -> Self {
        Self {
            last_login: Some((at, ip)),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hostname.is_none() && self.admin_email.is_none() && self.admin_password_hash.is_none() && self.last_login.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StatusFilter {
    #[default]
    Active,
    Removed,
    All,
}

/// Filter for listing tenants
#[derive(Debug, Clone)]
pub struct TenantFilter {
    pub service_type: Option<ServiceType>,
    pub status: StatusFilter,
    pub donors_only: bool,
    pub not_installed: bool,
    pub email_contains: Option<String>,
    pub hostname_contains: Option<String>,
    /// Matches the creation or last login address
    pub ip: Option<String>,
    pub skip: i64,
    pub limit: Option<i64>,
}

impl Default for TenantFilter {
    fn default() -> Self {
        Self {
            service_type: None,
            status: StatusFilter::Active,
            donors_only: false,
            not_installed: false,
            email_contains: None,
            hostname_contains: None,
            ip: None,
            skip: 0,
            limit: None,
        }
    }
}

impl TenantFilter {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn with_service_type(mut self, service_type: Option<ServiceType>) -> Self {
        self.service_type = service_type;
        self
    }

    /// In-process evaluation, shared with the in-memory repository
    pub fn matches(&self, tenant: &Tenant) -> bool {
        let status_ok = match self.status {
            StatusFilter::Active => !tenant.is_removed(),
            StatusFilter::Removed => tenant.is_removed(),
            StatusFilter::All => true,
        };
        status_ok
            && self.service_type.is_none_or(|s| s == tenant.service_type)
            && (!self.donors_only || tenant.is_donor())
            && (!self.not_installed || !tenant.is_installed())
            && self
                .email_contains
                .as_deref()
                .is_none_or(|needle| tenant.admin_email.to_lowercase().contains(&needle.to_lowercase()))
            && self
                .hostname_contains
                .as_deref()
                .is_none_or(|needle| tenant.hostname.contains(&needle.to_lowercase()))
            && self.ip.as_deref().is_none_or(|ip| {
                tenant.created_ip.as_deref() == Some(ip) || tenant.last_login_ip.as_deref() == Some(ip)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(hostname: &str) -> Tenant {
        let now = Utc::now();
        Tenant {
            tag: "forum1".to_string(),
            service_type: ServiceType::Flarum,
            hostname: hostname.to_string(),
            admin_email: "a@x.com".to_string(),
            admin_password_hash: "$argon2id$secret".to_string(),
            created_at: now,
            updated_at: now,
            installed_at: None,
            failed_at: None,
            failure: None,
            removed_at: None,
            removal_reason: None,
            removed_ip: None,
            created_ip: None,
            last_login_at: None,
            last_login_ip: None,
            donated_amount: Decimal::ZERO,
        }
    }

    #[test]
    fn test_state_is_derived_from_timestamps() {
        let mut t = tenant("forum1.example.com");
        assert_eq!(t.state(), TenantState::Provisioning);
        t.failed_at = Some(Utc::now());
        assert_eq!(t.state(), TenantState::Failed);
        t.installed_at = Some(Utc::now());
        assert_eq!(t.state(), TenantState::Installed);
        t.removed_at = Some(Utc::now());
        assert_eq!(t.state(), TenantState::Removed);
    }

    #[test]
    fn test_parent_domain_and_custom_domain() {
        let allowed = vec!["example.com".to_string()];

        let t = tenant("forum1.example.com");
        assert_eq!(t.parent_domain(), "example.com");
        assert!(!t.uses_custom_domain(&allowed));

        let t = tenant("forum.mysite.org");
        assert_eq!(t.parent_domain(), "mysite.org");
        assert!(t.uses_custom_domain(&allowed));
    }

    #[test]
    fn test_donor_perks_threshold() {
        let mut t = tenant("forum1.example.com");
        let threshold = Decimal::new(700, 2);
        assert!(!t.is_donor());
        t.donated_amount = Decimal::new(350, 2);
        assert!(t.is_donor());
        assert!(!t.has_donor_perks(threshold));
        t.donated_amount = Decimal::new(700, 2);
        assert!(t.has_donor_perks(threshold));
    }

    #[test]
    fn test_password_hash_never_rendered() {
        let t = tenant("forum1.example.com");
        assert!(!format!("{t:?}").contains("argon2"));
        assert!(!serde_json::to_string(&t).unwrap().contains("argon2"));
    }
}
