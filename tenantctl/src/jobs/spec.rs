//! Typed job parameters.
//!
//! Every job kind has its own parameter struct. Specs are validated before launch and flattened
//! into a map of scalar values (`string`, `int`, `bool`), which is all the execution environment
//! accepts. The map always carries `job_schema_version` so playbooks can reject parameter sets
//! they do not understand.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{Error, Result};
use crate::types::{ServiceType, validate_hostname, validate_tag_syntax};

/// Version of the flattened parameter layout below
pub const PARAMS_SCHEMA_VERSION: i64 = 1;

const MAX_REASON_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Provision,
    Remove,
    Backup,
    Restore,
    Upgrade,
    RewriteUrls,
    UpdateConfig,
    CollectStats,
    BackupSystem,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Provision => "provision",
            JobKind::Remove => "remove",
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
            JobKind::Upgrade => "upgrade",
            JobKind::RewriteUrls => "rewrite_urls",
            JobKind::UpdateConfig => "update_config",
            JobKind::CollectStats => "collect_stats",
            JobKind::BackupSystem => "backup_system",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionParams {
    pub tag: String,
    pub hostname: String,
    pub service_type: ServiceType,
    pub admin_email: String,
    /// Reset token the welcome mail links to, so the admin can choose a password
    pub reset_token: String,
    /// Overwrite leftovers of an earlier attempt
    pub force: bool,
    pub send_email: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveParams {
    pub tag: String,
    pub service_type: ServiceType,
    pub hostname: String,
    pub admin_email: String,
    /// Skip the final archive (full deletion on request)
    pub skip_backup: bool,
    pub send_email: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackupMode {
    /// One-off archive kept in the attic
    Attic,
    /// Rotating scheduled backup
    Periodic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupParams {
    pub tag: String,
    pub service_type: ServiceType,
    pub mode: BackupMode,
    /// Periodic backups older than this are pruned
    pub delete_older_than_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    Attic,
    Periodic { date: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreParams {
    pub tag: String,
    pub service_type: ServiceType,
    pub source: RestoreSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeParams {
    pub tag: String,
    pub service_type: ServiceType,
    /// Re-sync the file tree from the skeleton before migrating
    pub sync_files: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteUrlsParams {
    pub tag: String,
    pub service_type: ServiceType,
    pub old_hostname: String,
    pub new_hostname: String,
}

/// Values merged into the site's own configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateConfigParams {
    pub tag: String,
    pub service_type: ServiceType,
    pub donated_amount: Decimal,
    pub donor_perks: bool,
}

/// Counts content, users and upload size; the playbook reports them as a `tenant_stats` result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectStatsParams {
    pub tag: String,
    pub service_type: ServiceType,
}

/// Archive of the host's own configuration, not tied to a site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSystemParams {
    /// Older archives are pruned; `None` keeps them all
    pub delete_older_than_days: Option<i64>,
}

/// One job invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    Provision(ProvisionParams),
    Remove(RemoveParams),
    Backup(BackupParams),
    Restore(RestoreParams),
    Upgrade(UpgradeParams),
    RewriteUrls(RewriteUrlsParams),
    UpdateConfig(UpdateConfigParams),
    CollectStats(CollectStatsParams),
    BackupSystem(BackupSystemParams),
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::Provision(_) => JobKind::Provision,
            JobSpec::Remove(_) => JobKind::Remove,
            JobSpec::Backup(_) => JobKind::Backup,
            JobSpec::Restore(_) => JobKind::Restore,
            JobSpec::Upgrade(_) => JobKind::Upgrade,
            JobSpec::RewriteUrls(_) => JobKind::RewriteUrls,
            JobSpec::UpdateConfig(_) => JobKind::UpdateConfig,
            JobSpec::CollectStats(_) => JobKind::CollectStats,
            JobSpec::BackupSystem(_) => JobKind::BackupSystem,
        }
    }

    /// The site the job acts on; host-level jobs have none
    pub fn tag(&self) -> Option<&str> {
        match self {
            JobSpec::Provision(p) => Some(&p.tag),
            JobSpec::Remove(p) => Some(&p.tag),
            JobSpec::Backup(p) => Some(&p.tag),
            JobSpec::Restore(p) => Some(&p.tag),
            JobSpec::Upgrade(p) => Some(&p.tag),
            JobSpec::RewriteUrls(p) => Some(&p.tag),
            JobSpec::UpdateConfig(p) => Some(&p.tag),
            JobSpec::CollectStats(p) => Some(&p.tag),
            JobSpec::BackupSystem(_) => None,
        }
    }

    fn service_type(&self) -> Option<ServiceType> {
        match self {
            JobSpec::Provision(p) => Some(p.service_type),
            JobSpec::Remove(p) => Some(p.service_type),
            JobSpec::Backup(p) => Some(p.service_type),
            JobSpec::Restore(p) => Some(p.service_type),
            JobSpec::Upgrade(p) => Some(p.service_type),
            JobSpec::RewriteUrls(p) => Some(p.service_type),
            JobSpec::UpdateConfig(p) => Some(p.service_type),
            JobSpec::CollectStats(p) => Some(p.service_type),
            JobSpec::BackupSystem(_) => None,
        }
    }

    /// Playbook implementing this job kind. Removal and backup share one playbook and are
    /// told apart by tags.
    pub fn playbook(&self) -> &'static str {
        match self {
            JobSpec::Provision(_) => "provision_main.yml",
            JobSpec::Remove(_) | JobSpec::Backup(_) => "backup_main.yml",
            JobSpec::Restore(_) => "restore_main.yml",
            JobSpec::Upgrade(_) => "upgrade_main.yml",
            JobSpec::RewriteUrls(_) => "rewrite_urls.yml",
            JobSpec::UpdateConfig(_) => "tenant_config.yml",
            JobSpec::CollectStats(_) => "collect_stats.yml",
            JobSpec::BackupSystem(_) => "backup_system.yml",
        }
    }

    /// Tags selecting the sub-behavior of the playbook
    pub fn tags(&self) -> Option<&'static str> {
        match self {
            JobSpec::Provision(p) if p.send_email => Some("send-email"),
            JobSpec::Provision(_)
            | JobSpec::Remove(_)
            | JobSpec::Upgrade(_)
            | JobSpec::RewriteUrls(_)
            | JobSpec::UpdateConfig(_)
            | JobSpec::CollectStats(_)
            | JobSpec::BackupSystem(_) => None,
            JobSpec::Backup(p) => Some(match p.mode {
                BackupMode::Attic => "backup",
                BackupMode::Periodic => "periodic",
            }),
            JobSpec::Restore(p) => Some(match p.source {
                RestoreSource::Attic => "attic",
                RestoreSource::Periodic { .. } => "periodic",
            }),
        }
    }

    /// Check every parameter before anything is launched.
    pub fn validate(&self) -> Result<()> {
        if let Some(tag) = self.tag() {
            validate_tag_syntax(tag)?;
        }

        match self {
            JobSpec::Provision(p) => {
                validate_hostname(&p.hostname)?;
                validate_email(&p.admin_email)?;
                if p.reset_token.is_empty() {
                    return Err(Error::validation("Provisioning requires a reset token."));
                }
            }
            JobSpec::Remove(p) => {
                validate_hostname(&p.hostname)?;
                validate_email(&p.admin_email)?;
                if p.reason.chars().count() > MAX_REASON_LEN {
                    return Err(Error::validation(format!(
                        "Removal reason must be at most {MAX_REASON_LEN} characters."
                    )));
                }
            }
            JobSpec::Backup(p) => validate_retention(p.delete_older_than_days)?,
            JobSpec::BackupSystem(p) => {
                if let Some(days) = p.delete_older_than_days {
                    validate_retention(days)?;
                }
            }
            JobSpec::UpdateConfig(p) => {
                if p.donated_amount < Decimal::ZERO {
                    return Err(Error::validation("Donated amount cannot be negative."));
                }
            }
            JobSpec::Restore(_) | JobSpec::Upgrade(_) | JobSpec::CollectStats(_) => {}
            JobSpec::RewriteUrls(p) => {
                validate_hostname(&p.old_hostname)?;
                validate_hostname(&p.new_hostname)?;
                if p.old_hostname == p.new_hostname {
                    return Err(Error::validation("URL rewrite needs two different hostnames."));
                }
            }
        }
        Ok(())
    }

    /// Flatten into the scalar parameter map handed to the executor.
    pub fn params(&self) -> BTreeMap<&'static str, ParamValue> {
        let mut params = BTreeMap::new();
        params.insert("job_schema_version", PARAMS_SCHEMA_VERSION.into());
        if let Some(tag) = self.tag() {
            params.insert("tenant_tag", tag.into());
        }
        if let Some(service_type) = self.service_type() {
            params.insert("service_type", service_type.as_str().into());
        }

        match self {
            JobSpec::Provision(p) => {
                params.insert("tenant_hostname", p.hostname.as_str().into());
                params.insert("tenant_admin_email", p.admin_email.as_str().into());
                params.insert("tenant_reset_token", p.reset_token.as_str().into());
                params.insert("force", p.force.into());
            }
            JobSpec::Remove(p) => {
                params.insert("tenant_hostname", p.hostname.as_str().into());
                params.insert("tenant_admin_email", p.admin_email.as_str().into());
                params.insert("skip_backup", p.skip_backup.into());
                params.insert("send_email", p.send_email.into());
                params.insert("removal_reason", p.reason.as_str().into());
            }
            JobSpec::Backup(p) => {
                params.insert("skip_backup", false.into());
                params.insert("delete_older_than_days", p.delete_older_than_days.into());
            }
            JobSpec::Restore(p) => {
                if let RestoreSource::Periodic { date } = p.source {
                    params.insert("backup_date", date.format("%Y-%m-%d").to_string().into());
                }
            }
            JobSpec::Upgrade(p) => {
                params.insert("sync_files", p.sync_files.into());
            }
            JobSpec::RewriteUrls(p) => {
                params.insert("old_hostname", p.old_hostname.as_str().into());
                params.insert("new_hostname", p.new_hostname.as_str().into());
            }
            JobSpec::UpdateConfig(p) => {
                // Strings keep the cents exact.
                params.insert("donated_amount", p.donated_amount.round_dp(2).to_string().into());
                params.insert("donor_perks", p.donor_perks.into());
            }
            JobSpec::CollectStats(_) => {}
            JobSpec::BackupSystem(p) => {
                // The playbook treats a negative retention as "keep everything".
                params.insert("delete_older_than_days", p.delete_older_than_days.unwrap_or(-1).into());
            }
        }
        params
    }
}

fn validate_retention(days: i64) -> Result<()> {
    if (1..=365).contains(&days) {
        Ok(())
    } else {
        Err(Error::validation("Backup retention must be between 1 and 365 days."))
    }
}

fn validate_email(email: &str) -> Result<()> {
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace));
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!("'{email}' is not a valid e-mail address.")))
    }
}
