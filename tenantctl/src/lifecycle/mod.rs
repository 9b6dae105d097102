//! Tenant lifecycle orchestration.
//!
//! The [`Orchestrator`] owns the tenant state machine:
//!
//! ```text
//!   create ──► Provisioning ──job ok──► Installed ──remove──► Removed
//!                  │    ▲                  │  ▲
//!               job│    │retry             └──┘ hostname changes, upgrades,
//!               failed  │                       backups, restores
//!                  ▼    │
//!                 Failed ───────remove──────────────────────► Removed
//! ```
//!
//! Every operation takes the tag's lock for its whole duration, runs at most one external job
//! per step and commits each transition as its own short repository call, never spanning a job.
//! Validation, conflict and authorization problems are detected before anything is launched.
//! Provisioning runs in the background [`worker::Daemon`]; its failures are recorded on the
//! tenant rather than returned to whoever signed up.
//!
//! Housekeeping runs sweep all installed sites: [`Orchestrator::collect_stats`] snapshots their
//! usage and [`Orchestrator::cleanup`] removes those the snapshots show to be abandoned or
//! abusive.

pub mod cleanup;
pub mod locks;
pub mod worker;

#[cfg(test)]
mod tests;

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::auth::password::{Argon2Params, generate_throwaway_password, hash_password};
use crate::auth::tokens::TokenIssuer;
use crate::config::{CleanupConfig, Config};
use crate::db::handlers::TenantRepository;
use crate::db::errors::DbError;
use crate::db::handlers::repository::{HOSTNAME_CONSTRAINT, TAG_CONSTRAINT};
use crate::db::models::stats::SiteStats;
use crate::db::models::tenants::{NewTenant, Tenant, TenantFilter, TenantState, TenantUpdate};
use crate::errors::{Error, Result};
use crate::jobs::events::parse_tenant_stats;
use crate::jobs::spec::{
    BackupParams, BackupSystemParams, CollectStatsParams, ProvisionParams, RemoveParams, RestoreParams,
    RewriteUrlsParams, UpgradeParams,
};
use crate::jobs::{BackupMode, FailedStep, JobExecutor, JobFailure, JobKind, JobResult, JobSpec, RestoreSource};
use crate::routing::DomainRouter;
use crate::types::{ServiceType, default_hostname, normalize_hostname, validate_email, validate_tag};

pub use cleanup::{Flagged, classify};
pub use locks::{TagGuard, TagLocks};
pub use worker::{Daemon, JobQueue, JobReceiver, JobTicket, ProvisionOutcome, ProvisionRequest};

/// Failure message fragment meaning leftovers of an earlier attempt are in the way
const ALREADY_EXISTS: &str = "already exists";

/// Retention passed to the archive taken before removal
const ATTIC_KEEP_DAYS: i64 = 7;

/// Lock key for jobs that touch the platform rather than one site
const SYSTEM_LOCK: &str = ":system";

/// Signup request
#[derive(Debug, Clone)]
pub struct CreateTenant {
    pub tag: String,
    pub service_type: ServiceType,
    pub admin_email: String,
    /// Defaults to the main domain
    pub parent_domain: Option<String>,
    pub created_ip: Option<String>,
    pub force: bool,
    pub send_email: bool,
}

/// Removal request
#[derive(Debug, Clone)]
pub struct RemoveTenant {
    pub identifier: String,
    pub skip_backup: bool,
    pub reason: String,
    pub ip: Option<String>,
    pub send_email: bool,
}

/// A tenant that was recorded and queued for provisioning
pub struct Scheduled {
    pub tenant: Tenant,
    pub ticket: JobTicket,
}

/// Known classes of provisioning failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Leftovers of an earlier attempt; retrying with force overwrites them
    AlreadyExists,
    Other,
}

impl FailureClass {
    pub fn of(failure: &JobFailure) -> Self {
        if failure.mentions(ALREADY_EXISTS) {
            FailureClass::AlreadyExists
        } else {
            FailureClass::Other
        }
    }
}

/// Outcome of a hostname change
#[derive(Debug, Clone)]
pub struct HostnameChange {
    pub tenant: Tenant,
    pub old_hostname: String,
    /// The hostname stays changed even if rewriting embedded URLs failed.
    pub rewrite_error: Option<String>,
    pub routing_error: Option<String>,
}

/// Per-tenant result of a bulk operation
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sites a cleanup run picked and, unless it was a dry run, what became of them
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub flagged: Vec<Flagged>,
    pub removed: BatchReport,
}

pub struct Orchestrator {
    tenants: Arc<dyn TenantRepository>,
    jobs: Arc<dyn JobExecutor>,
    router: Arc<DomainRouter>,
    tokens: Arc<TokenIssuer>,
    locks: TagLocks,
    queue: JobQueue,
    password_hashing: Argon2Params,
    allowed_domains: Vec<String>,
    perks_threshold: Decimal,
    cleanup: CleanupConfig,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        tenants: Arc<dyn TenantRepository>,
        jobs: Arc<dyn JobExecutor>,
        router: Arc<DomainRouter>,
        tokens: Arc<TokenIssuer>,
        queue: JobQueue,
    ) -> Self {
        Self {
            tenants,
            jobs,
            router,
            tokens,
            locks: TagLocks::new(),
            queue,
            password_hashing: config.password_hashing,
            allowed_domains: config.allowed_domains.clone(),
            perks_threshold: config.donations.perks_threshold,
            cleanup: config.cleanup.clone(),
        }
    }

    /// Replace the process-local tag locks, e.g. with [`TagLocks::with_postgres`]
    pub fn with_locks(mut self, locks: TagLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn router(&self) -> &DomainRouter {
        &self.router
    }

    pub fn locks(&self) -> &TagLocks {
        &self.locks
    }

    /// Active tenant by tag, e-mail or hostname
    pub async fn find_active(&self, identifier: &str) -> Result<Tenant> {
        self.tenants
            .get_by_identifier(identifier, false)
            .await?
            .ok_or_else(|| Error::not_found("Site", identifier))
    }

    fn require_installed(tenant: &Tenant) -> Result<()> {
        match tenant.state() {
            TenantState::Installed => Ok(()),
            state => Err(Error::conflict(format!("Site '{}' is {state}, not installed.", tenant.tag))),
        }
    }

    /// Record a new tenant and queue its provisioning. Returns without waiting for the job.
    #[instrument(skip(self, request), fields(tag = %request.tag, service_type = %request.service_type), err)]
    pub async fn create(&self, request: CreateTenant) -> Result<Scheduled> {
        validate_tag(&request.tag)?;
        validate_email(&request.admin_email)?;

        let parent = match &request.parent_domain {
            Some(domain) => normalize_hostname(domain),
            None => self.allowed_domains.first().cloned().unwrap_or_default(),
        };
        if !self.allowed_domains.contains(&parent) {
            return Err(Error::validation(format!("'{parent}' is not one of the platform domains.")));
        }
        let hostname = normalize_hostname(&default_hostname(&request.tag, &parent));

        let _lock = self.locks.try_acquire(&request.tag).await?;

        // The admin picks a real password through the reset link in the welcome mail.
        let admin_password_hash = hash_password(&generate_throwaway_password(), self.password_hashing)?;

        let inserted = self
            .tenants
            .insert(&NewTenant {
                tag: request.tag.clone(),
                service_type: request.service_type,
                hostname: hostname.clone(),
                admin_email: request.admin_email.trim().to_string(),
                admin_password_hash,
                created_ip: request.created_ip.clone(),
            })
            .await;
        let tenant = match inserted {
            Ok(tenant) => tenant,
            Err(e) if e.is_unique_violation_on(TAG_CONSTRAINT) => {
                return Err(Error::conflict(format!("Site tag '{}' is already taken.", request.tag)));
            }
            Err(e) if e.is_unique_violation_on(HOSTNAME_CONSTRAINT) => {
                return Err(self.hostname_conflict(&request.tag, &hostname).await);
            }
            Err(e) => return Err(e.into()),
        };
        info!(hostname = %tenant.hostname, "Site recorded, provisioning scheduled");

        let ticket = self.queue.submit(ProvisionRequest {
            tag: tenant.tag.clone(),
            force: request.force,
            send_email: request.send_email,
        })?;
        Ok(Scheduled { tenant, ticket })
    }

    /// Hostnames are the lowercased tag, so tags differing only in case collide there.
    async fn hostname_conflict(&self, tag: &str, hostname: &str) -> Error {
        match self.tenants.get_by_identifier(hostname, false).await {
            Ok(Some(holder)) if holder.tag != tag && holder.tag.eq_ignore_ascii_case(tag) => Error::conflict(format!(
                "Site tag '{tag}' is already taken as '{}'; tags differing only in case share the hostname '{hostname}'.",
                holder.tag
            )),
            _ => Error::conflict(format!("Hostname '{hostname}' is already in use.")),
        }
    }

    /// Run the provisioning job for a tenant still provisioning. Waits for the tag lock.
    #[instrument(skip(self, request), fields(tag = %request.tag, force = request.force), err)]
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome> {
        let _lock = self.locks.acquire(&request.tag).await?;

        let Some(tenant) = self.tenants.get(&request.tag).await? else {
            info!("Site vanished before provisioning, nothing to do");
            return Ok(None);
        };
        if tenant.state() != TenantState::Provisioning {
            info!(state = %tenant.state(), "Site is not provisioning, skipping");
            return Ok(Some(tenant.state()));
        }

        let spec = JobSpec::Provision(ProvisionParams {
            tag: tenant.tag.clone(),
            hostname: tenant.hostname.clone(),
            service_type: tenant.service_type,
            admin_email: tenant.admin_email.clone(),
            reset_token: self.tokens.issue_reset(&tenant)?,
            force: request.force,
            send_email: request.send_email,
        });

        let result = match self.jobs.run(&spec).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Provisioning job could not be launched");
                JobResult::failed(
                    None,
                    vec![FailedStep {
                        step: "launch".to_string(),
                        host: "localhost".to_string(),
                        message: e.to_string(),
                    }],
                )
            }
        };

        self.apply_provision_outcome(&tenant.tag, &result).await
    }

    /// Apply a finished provisioning attempt to the tenant.
    ///
    /// A tenant purged in the meantime is silently ignored, and a tenant that is already
    /// installed stays untouched.
    #[instrument(skip(self, result), fields(success = result.is_success()), err)]
    pub async fn finalize_provision(&self, tag: &str, result: &JobResult) -> Result<ProvisionOutcome> {
        let _lock = self.locks.acquire(tag).await?;
        self.apply_provision_outcome(tag, result).await
    }

    async fn apply_provision_outcome(&self, tag: &str, result: &JobResult) -> Result<ProvisionOutcome> {
        let Some(tenant) = self.tenants.get(tag).await? else {
            return Ok(None);
        };

        if result.is_success() {
            if self.tenants.mark_installed(tag, Utc::now()).await? {
                info!(elapsed = ?result.elapsed, "Site installed");
                self.sync_routes_logged().await;
                return Ok(Some(TenantState::Installed));
            }
            return Ok(Some(tenant.state()));
        }

        let failure = result.failure(JobKind::Provision);
        match FailureClass::of(&failure) {
            FailureClass::AlreadyExists => warn!(
                failed_steps = failure.failed_steps.len(),
                "Provisioning hit leftovers of an earlier attempt; retry with force"
            ),
            FailureClass::Other => warn!(failed_steps = failure.failed_steps.len(), "Provisioning failed"),
        }

        if self.tenants.mark_failed(tag, &failure, Utc::now()).await? {
            Ok(Some(TenantState::Failed))
        } else {
            Ok(Some(tenant.state()))
        }
    }

    /// Queue a provisioning attempt for an existing tenant.
    pub fn schedule_provision(&self, request: ProvisionRequest) -> Result<JobTicket> {
        self.queue.submit(request)
    }

    /// Failed -> Provisioning, then queue a forced provisioning attempt.
    #[instrument(skip(self), err)]
    pub async fn retry_provision(&self, tag: &str) -> Result<JobTicket> {
        let _lock = self.locks.try_acquire(tag).await?;

        let tenant = self
            .tenants
            .get(tag)
            .await?
            .ok_or_else(|| Error::not_found("Site", tag))?;
        if tenant.state() != TenantState::Failed {
            return Err(Error::conflict(format!(
                "Site '{tag}' is {}; only failed sites can be retried.",
                tenant.state()
            )));
        }

        self.tenants.clear_failure(tag).await?;
        self.queue.submit(ProvisionRequest {
            tag: tag.to_string(),
            force: true,
            send_email: false,
        })
    }

    /// Resubmit tenants stuck in provisioning for longer than `stale_after`.
    #[instrument(skip(self), err)]
    pub async fn reconcile_once(&self, stale_after: Duration) -> Result<Vec<JobTicket>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_after).map_err(anyhow::Error::from)?;
        let stale = self.tenants.list_stale_provisioning(cutoff).await?;

        let mut tickets = Vec::with_capacity(stale.len());
        for tenant in stale {
            if self.locks.is_locked(&tenant.tag).await? {
                continue;
            }
            warn!(tag = %tenant.tag, updated_at = %tenant.updated_at, "Resubmitting stale provisioning");
            tickets.push(self.queue.submit(ProvisionRequest {
                tag: tenant.tag,
                force: true,
                send_email: true,
            })?);
        }
        Ok(tickets)
    }

    /// Back up (unless skipped), run the removal job, then flip the tenant to removed.
    ///
    /// A failed backup aborts the removal. A failed removal job leaves the tenant as it was.
    #[instrument(skip(self, request), fields(identifier = %request.identifier, skip_backup = request.skip_backup), err)]
    pub async fn remove(&self, request: RemoveTenant) -> Result<Tenant> {
        let tenant = self.find_active(&request.identifier).await?;
        let _lock = self.locks.try_acquire(&tenant.tag).await?;
        // Re-read under the lock
        let tenant = self.find_active(&tenant.tag).await?;

        if tenant.state() == TenantState::Provisioning {
            return Err(Error::conflict(format!(
                "Site '{}' is still being provisioned; remove it once that has finished.",
                tenant.tag
            )));
        }

        // Both jobs are checked before either runs, so a bad request leaves no archive behind.
        let archive = (!request.skip_backup && tenant.is_installed()).then(|| {
            JobSpec::Backup(BackupParams {
                tag: tenant.tag.clone(),
                service_type: tenant.service_type,
                mode: BackupMode::Attic,
                delete_older_than_days: ATTIC_KEEP_DAYS,
            })
        });
        let removal = JobSpec::Remove(RemoveParams {
            tag: tenant.tag.clone(),
            service_type: tenant.service_type,
            hostname: tenant.hostname.clone(),
            admin_email: tenant.admin_email.clone(),
            // The archive, if wanted, is taken first.
            skip_backup: true,
            send_email: request.send_email,
            reason: request.reason.clone(),
        });
        if let Some(archive) = &archive {
            archive.validate()?;
        }
        removal.validate()?;

        if let Some(archive) = &archive {
            info!("Archiving site before removal");
            self.jobs.run_to_success(archive).await?;
        }
        self.jobs.run_to_success(&removal).await?;

        self.tenants
            .mark_removed(&tenant.tag, &request.reason, request.ip.as_deref(), Utc::now())
            .await?;
        info!(reason = %request.reason, "Site removed");
        self.sync_routes_logged().await;

        self.tenants
            .get(&tenant.tag)
            .await?
            .ok_or_else(|| Error::not_found("Site", &tenant.tag))
    }

    /// Move an installed tenant to another hostname under a platform domain or to a custom
    /// domain that passed verification.
    #[instrument(skip(self), err)]
    pub async fn change_hostname(&self, tag: &str, new_hostname: &str) -> Result<HostnameChange> {
        let _lock = self.locks.try_acquire(tag).await?;
        let tenant = self.find_active(tag).await?;
        Self::require_installed(&tenant)?;

        let hostname = normalize_hostname(new_hostname);
        if hostname == tenant.hostname {
            return Err(Error::conflict(format!("Site already uses '{hostname}'.")));
        }

        let hostname = if is_platform_host(&hostname, self.router.allowed_domains()) {
            self.router.check_default_hostname(&tenant, &hostname)?;
            hostname
        } else {
            self.router.verify_custom_domain(&tenant, &hostname).await?
        };

        self.apply_hostname(tenant, hostname).await
    }

    /// Link a verified custom domain as the tenant's hostname.
    #[instrument(skip(self), err)]
    pub async fn link_custom_domain(&self, tag: &str, domain: &str) -> Result<HostnameChange> {
        let _lock = self.locks.try_acquire(tag).await?;
        let tenant = self.find_active(tag).await?;
        Self::require_installed(&tenant)?;

        let domain = self.router.verify_custom_domain(&tenant, domain).await?;
        self.apply_hostname(tenant, domain).await
    }

    /// Go back to `{tag}.{fallback_parent_domain}`.
    #[instrument(skip(self), err)]
    pub async fn unlink_custom_domain(&self, tag: &str, fallback_parent_domain: &str) -> Result<HostnameChange> {
        let _lock = self.locks.try_acquire(tag).await?;
        let tenant = self.find_active(tag).await?;
        Self::require_installed(&tenant)?;

        let hostname = self.router.canonical_hostname(&tenant, fallback_parent_domain)?;
        self.apply_hostname(tenant, hostname).await
    }

    /// Store the new hostname, republish routing and rewrite embedded URLs. Caller holds the lock.
    async fn apply_hostname(&self, tenant: Tenant, hostname: String) -> Result<HostnameChange> {
        let old_hostname = tenant.hostname.clone();

        let rewrite = JobSpec::RewriteUrls(RewriteUrlsParams {
            tag: tenant.tag.clone(),
            service_type: tenant.service_type,
            old_hostname: old_hostname.clone(),
            new_hostname: hostname.clone(),
        });
        rewrite.validate()?;

        let updated = self
            .tenants
            .update(&tenant.tag, &TenantUpdate::hostname(hostname.clone()))
            .await
            .map_err(|e| match e {
                e if e.is_unique_violation_on(HOSTNAME_CONSTRAINT) => {
                    Error::conflict(format!("Hostname '{hostname}' is already in use."))
                }
                DbError::NotFound => Error::not_found("Site", &tenant.tag),
                e => e.into(),
            })?;
        info!(tag = %tenant.tag, old = %old_hostname, new = %hostname, "Hostname changed");

        let routing_error = self.sync_routes_logged().await;

        let rewrite_error = match self.jobs.run_to_success(&rewrite).await {
            Ok(_) => None,
            Err(e) => {
                warn!(tag = %tenant.tag, error = %e, "Rewriting embedded URLs failed; hostname change kept");
                Some(e.to_string())
            }
        };

        Ok(HostnameChange {
            tenant: updated,
            old_hostname,
            rewrite_error,
            routing_error,
        })
    }

    /// Run the idempotent maintenance job (migrations, cache clears). Safe to repeat.
    #[instrument(skip(self), err)]
    pub async fn upgrade(&self, tag: &str, sync_files: bool) -> Result<JobResult> {
        let _lock = self.locks.try_acquire(tag).await?;
        let tenant = self.find_active(tag).await?;
        Self::require_installed(&tenant)?;

        self.jobs
            .run_to_success(&JobSpec::Upgrade(UpgradeParams {
                tag: tenant.tag,
                service_type: tenant.service_type,
                sync_files,
            }))
            .await
    }

    /// Upgrade every active installed tenant matching `filter`, one at a time.
    #[instrument(skip(self, filter), err)]
    pub async fn upgrade_all(&self, filter: &TenantFilter, sync_files: bool) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for tenant in self.installed_matching(filter).await? {
            match self.upgrade(&tenant.tag, sync_files).await {
                Ok(_) => report.succeeded.push(tenant.tag),
                Err(e) => {
                    warn!(tag = %tenant.tag, error = %e, "Upgrade failed");
                    report.failed.push((tenant.tag, e));
                }
            }
        }
        info!(succeeded = report.succeeded.len(), failed = report.failed.len(), "Upgrade run finished");
        Ok(report)
    }

    /// Back up one installed tenant.
    #[instrument(skip(self), err)]
    pub async fn backup(&self, tag: &str, mode: BackupMode, keep_days: i64) -> Result<JobResult> {
        let _lock = self.locks.try_acquire(tag).await?;
        let tenant = self.find_active(tag).await?;
        Self::require_installed(&tenant)?;

        self.jobs
            .run_to_success(&JobSpec::Backup(BackupParams {
                tag: tenant.tag,
                service_type: tenant.service_type,
                mode,
                delete_older_than_days: keep_days,
            }))
            .await
    }

    /// Back up every active installed tenant, continuing past failures.
    #[instrument(skip(self), err)]
    pub async fn backup_all(&self, mode: BackupMode, keep_days: i64) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for tenant in self.installed_matching(&TenantFilter::active()).await? {
            match self.backup(&tenant.tag, mode, keep_days).await {
                Ok(_) => report.succeeded.push(tenant.tag),
                Err(e) => {
                    warn!(tag = %tenant.tag, error = %e, "Backup failed");
                    report.failed.push((tenant.tag, e));
                }
            }
        }
        Ok(report)
    }

    /// Restore an installed tenant's data from the attic or a periodic backup.
    #[instrument(skip(self), err)]
    pub async fn restore(&self, tag: &str, source: RestoreSource) -> Result<JobResult> {
        let _lock = self.locks.try_acquire(tag).await?;
        let tenant = self.find_active(tag).await?;
        Self::require_installed(&tenant)?;

        self.jobs
            .run_to_success(&JobSpec::Restore(RestoreParams {
                tag: tenant.tag,
                service_type: tenant.service_type,
                source,
            }))
            .await
    }

    /// Archive the platform itself: the tenant database, the proxy configuration and the
    /// orchestrator's own files. Older archives are pruned unless `keep_days` is `None`.
    #[instrument(skip(self), err)]
    pub async fn backup_system(&self, keep_days: Option<i64>) -> Result<JobResult> {
        let _lock = self.locks.try_acquire(SYSTEM_LOCK).await?;
        self.jobs
            .run_to_success(&JobSpec::BackupSystem(BackupSystemParams {
                delete_older_than_days: keep_days,
            }))
            .await
    }

    /// Snapshot usage of every active installed tenant. Sites busy with another operation are
    /// reported as failed and picked up by the next run.
    #[instrument(skip(self), err)]
    pub async fn collect_stats(&self) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for tenant in self.installed_matching(&TenantFilter::active()).await? {
            match self.collect_site_stats(&tenant).await {
                Ok(stats) => {
                    info!(
                        tag = %tenant.tag,
                        content = stats.content_count,
                        users = stats.user_count,
                        assets_mb = stats.assets_mb,
                        "Stats collected"
                    );
                    report.succeeded.push(tenant.tag);
                }
                Err(e) => {
                    warn!(tag = %tenant.tag, error = %e, "Stats collection failed");
                    report.failed.push((tenant.tag, e));
                }
            }
        }
        info!(succeeded = report.succeeded.len(), failed = report.failed.len(), "Stats run finished");
        Ok(report)
    }

    async fn collect_site_stats(&self, tenant: &Tenant) -> Result<SiteStats> {
        let _lock = self.locks.try_acquire(&tenant.tag).await?;
        let result = self
            .jobs
            .run_to_success(&JobSpec::CollectStats(CollectStatsParams {
                tag: tenant.tag.clone(),
                service_type: tenant.service_type,
            }))
            .await?;

        let reported = parse_tenant_stats(&result.stdout).ok_or_else(|| Error::ExternalJob {
            job: JobKind::CollectStats.to_string(),
            exit_code: result.exit_code,
            failed_steps: vec![FailedStep {
                step: "report stats".to_string(),
                host: tenant.tag.clone(),
                message: "the job finished without reporting tenant_stats".to_string(),
            }],
        })?;
        let stats = SiteStats {
            tag: tenant.tag.clone(),
            content_count: reported.content_count,
            user_count: reported.user_count,
            assets_mb: reported.assets_mb,
            collected_at: Utc::now(),
        };
        self.tenants.record_stats(&stats).await.map_err(|e| match e {
            DbError::NotFound => Error::not_found("Site", &tenant.tag),
            e => e.into(),
        })?;
        Ok(stats)
    }

    /// Find installed sites that are abandoned or far beyond the platform's limits, judged by
    /// their latest stats, and remove them unless `dry_run` is set.
    ///
    /// Sites younger than the configured minimum age, donors with perks and sites without
    /// stats are left alone. Fails if no stats were collected at all.
    #[instrument(skip(self), err)]
    pub async fn cleanup(&self, dry_run: bool, send_email: bool) -> Result<CleanupReport> {
        let mut latest = self.tenants.latest_stats().await?;
        if latest.is_empty() {
            return Err(Error::conflict("No stats collected yet. Run collect-stats first."));
        }

        let min_age = chrono::Duration::from_std(self.cleanup.min_age).map_err(|_| Error::Internal {
            operation: "cleanup: minimum age out of range".to_string(),
        })?;
        let cutoff = Utc::now() - min_age;

        let mut report = CleanupReport::default();
        for tenant in self.installed_matching(&TenantFilter::active()).await? {
            if tenant.created_at > cutoff || tenant.has_donor_perks(self.perks_threshold) {
                continue;
            }
            let Some(stats) = latest.remove(&tenant.tag) else {
                continue;
            };
            if let Some(reason) = classify(&stats, &self.cleanup) {
                info!(tag = %tenant.tag, %reason, dry_run, "Site flagged for cleanup");
                report.flagged.push(Flagged { tenant, stats, reason });
            }
        }

        if dry_run {
            return Ok(report);
        }

        for flagged in &report.flagged {
            let tag = flagged.tenant.tag.clone();
            let request = RemoveTenant {
                identifier: tag.clone(),
                skip_backup: false,
                reason: format!("auto-cleanup: {}", flagged.reason),
                ip: None,
                send_email,
            };
            match self.remove(request).await {
                Ok(_) => report.removed.succeeded.push(tag),
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Cleanup removal failed");
                    report.removed.failed.push((tag, e));
                }
            }
        }
        info!(
            flagged = report.flagged.len(),
            removed = report.removed.succeeded.len(),
            failed = report.removed.failed.len(),
            "Cleanup run finished"
        );
        Ok(report)
    }

    /// Republish the routing table from the repository.
    pub async fn sync_routes(&self) -> Result<usize> {
        Ok(self.router.sync_routing_table().await?.len())
    }

    async fn installed_matching(&self, filter: &TenantFilter) -> Result<Vec<Tenant>> {
        Ok(self
            .tenants
            .list(filter)
            .await?
            .into_iter()
            .filter(|t| t.state() == TenantState::Installed)
            .collect())
    }

    /// Publish routing after a committed transition. A failure is logged and returned for
    /// reporting; the next successful sync converges the table anyway.
    async fn sync_routes_logged(&self) -> Option<String> {
        match self.router.sync_routing_table().await {
            Ok(_) => None,
            Err(e) => {
                error!(error = %e, "Routing table sync failed");
                Some(e.to_string())
            }
        }
    }
}

fn is_platform_host(hostname: &str, allowed_domains: &[String]) -> bool {
    crate::types::matching_parent_domain(hostname, allowed_domains).is_some()
}
