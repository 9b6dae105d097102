//! Domain routing: the hostname to tenant table consumed by the edge proxy.
//!
//! The table is always rebuilt in full from the tenant repository and published with a single
//! atomic rename, then the proxy is told to reload. There is no incremental patching, so a crash
//! halfway through a sync can never leave a half-applied table behind, and concurrent syncs
//! converge on whatever the repository says last.
//!
//! Custom-domain onboarding checks live here too: [`DomainRouter::verify_custom_domain`] and
//! [`DomainRouter::canonical_hostname`] decide whether a hostname change is allowed; the
//! orchestrator applies it.
//!
//! - [`map`]: rendering and atomic publication
//! - [`proxy`]: the reload trigger
//! - [`dns`]: DNS verification of custom domains

pub mod dns;
pub mod map;
pub mod proxy;

use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::config::Config;
use crate::db::handlers::TenantRepository;
use crate::db::models::tenants::Tenant;
use crate::errors::{Error, Result};
use crate::types::{default_hostname, matching_parent_domain, normalize_hostname, validate_hostname};

pub use dns::{DnsVerifier, SystemDnsVerifier};
pub use map::RoutingTable;
pub use proxy::{CommandReload, EdgeProxy, NoReload};

pub struct DomainRouter {
    tenants: Arc<dyn TenantRepository>,
    proxy: Arc<dyn EdgeProxy>,
    dns: Arc<dyn DnsVerifier>,
    map_path: PathBuf,
    allowed_domains: Vec<String>,
    cname_target: String,
    perks_threshold: Decimal,
    /// Serializes publications within this process
    sync_lock: Mutex<()>,
}

impl DomainRouter {
    pub fn new(config: &Config, tenants: Arc<dyn TenantRepository>, proxy: Arc<dyn EdgeProxy>, dns: Arc<dyn DnsVerifier>) -> Self {
        Self {
            tenants,
            proxy,
            dns,
            map_path: config.routing.map_path.clone(),
            allowed_domains: config.allowed_domains.clone(),
            cname_target: config.cname_target(),
            perks_threshold: config.donations.perks_threshold,
            sync_lock: Mutex::new(()),
        }
    }

    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    /// Rebuild the table from every active tenant, publish it, reload the proxy.
    #[instrument(skip(self), fields(path = %self.map_path.display()), err)]
    pub async fn sync_routing_table(&self) -> Result<RoutingTable> {
        let _guard = self.sync_lock.lock().await;

        let tenants = self.tenants.list_active().await?;
        let table = RoutingTable::from_tenants(&tenants);
        map::publish(&self.map_path, table.render()).await?;
        self.proxy.reload().await?;

        info!(entries = table.len(), "Published routing table");
        Ok(table)
    }

    /// Check that `domain` may become `tenant`'s custom hostname; returns it normalized.
    #[instrument(skip(self, tenant), fields(tag = %tenant.tag), err)]
    pub async fn verify_custom_domain(&self, tenant: &Tenant, domain: &str) -> Result<String> {
        let domain = normalize_hostname(domain);
        validate_hostname(&domain)?;

        if matching_parent_domain(&domain, &self.allowed_domains).is_some() {
            return Err(Error::validation(format!(
                "'{domain}' belongs to the platform; pick one of the platform domains instead of linking it."
            )));
        }

        if !tenant.has_donor_perks(self.perks_threshold) {
            return Err(Error::Authorization {
                message: format!(
                    "Custom domains are available once donations reach {}.",
                    self.perks_threshold
                ),
            });
        }

        if tenant.hostname == domain {
            return Err(Error::conflict(format!("'{domain}' is already linked to this site.")));
        }

        if let Some(holder) = self.tenants.get_by_identifier(&domain, false).await?
            && holder.hostname == domain
            && holder.tag != tenant.tag
        {
            return Err(Error::DomainAlreadyLinked {
                domain,
                tag: holder.tag,
            });
        }

        if !self.dns.points_to(&domain, &self.cname_target).await? {
            return Err(Error::CnameNotFound {
                domain,
                target: self.cname_target.clone(),
            });
        }

        Ok(domain)
    }

    /// `{tag}.{fallback}` for unlinking a custom domain
    pub fn canonical_hostname(&self, tenant: &Tenant, fallback_parent_domain: &str) -> Result<String> {
        let parent = normalize_hostname(fallback_parent_domain);
        if !self.allowed_domains.contains(&parent) {
            return Err(Error::validation(format!("'{parent}' is not one of the platform domains.")));
        }

        let hostname = normalize_hostname(&default_hostname(&tenant.tag, &parent));
        if tenant.hostname == hostname {
            return Err(Error::conflict(format!("Site already uses '{hostname}'; nothing to unlink.")));
        }
        Ok(hostname)
    }

    /// A default-domain hostname is only valid for its own tag.
    pub fn check_default_hostname(&self, tenant: &Tenant, hostname: &str) -> Result<()> {
        match matching_parent_domain(hostname, &self.allowed_domains) {
            Some(parent) if normalize_hostname(&default_hostname(&tenant.tag, parent)) == hostname => Ok(()),
            Some(parent) => Err(Error::validation(format!(
                "Hostnames under {parent} must be '{}'.",
                normalize_hostname(&default_hostname(&tenant.tag, parent))
            ))),
            None => Err(Error::validation(format!("'{hostname}' is not under a platform domain."))),
        }
    }
}
