//! Operator command line.
//!
//! Each subcommand maps onto one orchestrator (or ledger) call. One-shot commands that queue
//! provisioning run a private worker without the sweep and wait for their own jobs.

use chrono::NaiveDate;
use clap::{Subcommand, ValueEnum};
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::Services;
use crate::db::handlers::TenantRepository;
use crate::db::models::tenants::{StatusFilter, Tenant, TenantFilter, TenantState};
use crate::errors::Error;
use crate::jobs::{BackupMode, JobKind, RestoreSource};
use crate::lifecycle::{BatchReport, CreateTenant, JobTicket, RemoveTenant};
use crate::types::{ServiceType, normalize_hostname};
use crate::{Application, Config};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Record a new site and provision it
    Create {
        tag: String,
        service_type: ServiceType,
        admin_email: String,
        /// Parent domain; defaults to the main domain
        #[arg(long)]
        domain: Option<String>,
        /// Overwrite leftovers of an earlier attempt
        #[arg(long)]
        force: bool,
        /// Do not send the welcome e-mail
        #[arg(long)]
        no_email: bool,
    },
    /// Archive and remove a site
    Remove {
        /// Tag, admin e-mail or hostname
        identifier: String,
        #[arg(long)]
        skip_backup: bool,
        #[arg(long, default_value = "operator")]
        reason: String,
        /// Tell the admin about the removal
        #[arg(long)]
        notify: bool,
    },
    /// Back up one site or every installed site
    Backup {
        #[arg(required_unless_present = "all")]
        identifier: Option<String>,
        #[arg(long, conflicts_with = "identifier")]
        all: bool,
        /// Rotating backup instead of a one-off attic archive
        #[arg(long)]
        periodic: bool,
        #[arg(long, default_value_t = 7)]
        keep_days: i64,
    },
    /// Restore a site's data
    Restore {
        identifier: String,
        #[arg(long = "from", value_enum)]
        source: RestoreFrom,
        /// Backup date for `--from periodic` (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run the maintenance job on one site or a selection
    Upgrade {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        service: Option<ServiceType>,
        #[arg(long)]
        sync_files: bool,
    },
    /// Archive the platform itself
    BackupSystem {
        /// Prune system archives older than this many days; negative keeps them all
        #[arg(long, default_value_t = 7, allow_negative_numbers = true)]
        delete_older_than: i64,
    },
    /// Snapshot the usage of every installed site
    CollectStats,
    /// List abandoned or abusive sites and, with `--execute`, remove them
    Cleanup {
        /// Remove the flagged sites instead of only listing them
        #[arg(long)]
        execute: bool,
        /// Do not tell the admins about the removal
        #[arg(short = 'n', long)]
        no_send_email: bool,
    },
    /// Retry a failed provisioning with force
    Retry { tag: String },
    /// List sites
    List {
        #[arg(long)]
        service: Option<ServiceType>,
        #[arg(long, value_enum, default_value_t = StatusFilter::Active)]
        status: StatusFilter,
        #[arg(long)]
        donors: bool,
        #[arg(long)]
        not_installed: bool,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        /// Created-from or last-login IP
        #[arg(long)]
        ip: Option<String>,
        #[arg(long, default_value_t = 0)]
        skip: i64,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Show one site
    Info { identifier: String },
    /// Point a site at a hostname.
    ///
    /// A bare platform domain unlinks back to `{tag}.{domain}`, a hostname under a platform domain
    /// renames, anything else is linked as a custom domain.
    LinkDomain { hostname: String, identifier: String },
    /// Republish the routing table
    SyncRoutes,
    /// Credit a donation
    Donate { identifier: String, amount: String },
    /// Resubmit sites stuck in provisioning and wait for them
    Reconcile,
    /// Run the worker daemon and HTTP surface
    Serve,
    /// Apply database migrations
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RestoreFrom {
    Attic,
    Periodic,
}

/// Run `command` to completion. `shutdown` only matters for `serve`.
pub async fn run<F>(command: Command, config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if matches!(command, Command::Serve) {
        return Application::new(config).await?.serve(shutdown).await;
    }

    let mut services = Services::connect(config).await?;
    let worker_shutdown = CancellationToken::new();
    let worker = services.start_worker(worker_shutdown.clone(), false)?;

    let result = execute(&services, command).await;

    stop_worker(&worker_shutdown, worker).await;
    services.close().await;
    result
}

/// Cancel the worker and wait for it. Returns false if it panicked or was aborted.
async fn stop_worker(shutdown: &CancellationToken, worker: JoinHandle<()>) -> bool {
    shutdown.cancel();
    match worker.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Provisioning worker ended abnormally");
            false
        }
    }
}

async fn execute(services: &Services, command: Command) -> anyhow::Result<()> {
    let orchestrator = &services.orchestrator;

    match command {
        Command::Create {
            tag,
            service_type,
            admin_email,
            domain,
            force,
            no_email,
        } => {
            let scheduled = orchestrator
                .create(CreateTenant {
                    tag,
                    service_type,
                    admin_email,
                    parent_domain: domain,
                    created_ip: None,
                    force,
                    send_email: !no_email,
                })
                .await?;
            println!("Provisioning {} at {}...", scheduled.tenant.tag, scheduled.tenant.hostname);
            await_provisioning(services, scheduled.ticket).await
        }
        Command::Remove {
            identifier,
            skip_backup,
            reason,
            notify,
        } => {
            let tenant = orchestrator
                .remove(RemoveTenant {
                    identifier,
                    skip_backup,
                    reason,
                    ip: None,
                    send_email: notify,
                })
                .await?;
            println!("Removed {}", tenant.tag);
            Ok(())
        }
        Command::Backup {
            identifier,
            all,
            periodic,
            keep_days,
        } => {
            let mode = if periodic { BackupMode::Periodic } else { BackupMode::Attic };
            match identifier {
                Some(identifier) if !all => {
                    let tenant = orchestrator.find_active(&identifier).await?;
                    orchestrator.backup(&tenant.tag, mode, keep_days).await?;
                    println!("Backed up {}", tenant.tag);
                    Ok(())
                }
                _ => report("backup", orchestrator.backup_all(mode, keep_days).await?),
            }
        }
        Command::Restore { identifier, source, date } => {
            let source = match (source, date) {
                (RestoreFrom::Attic, _) => RestoreSource::Attic,
                (RestoreFrom::Periodic, Some(date)) => RestoreSource::Periodic { date },
                (RestoreFrom::Periodic, None) => {
                    return Err(Error::validation("Restoring a periodic backup needs --date.").into());
                }
            };
            let tenant = orchestrator.find_active(&identifier).await?;
            orchestrator.restore(&tenant.tag, source).await?;
            println!("Restored {}", tenant.tag);
            Ok(())
        }
        Command::Upgrade { tag, service, sync_files } => match tag {
            Some(tag) => {
                orchestrator.upgrade(&tag, sync_files).await?;
                println!("Upgraded {tag}");
                Ok(())
            }
            None => {
                let filter = TenantFilter::active().with_service_type(service);
                report("upgrade", orchestrator.upgrade_all(&filter, sync_files).await?)
            }
        },
        Command::BackupSystem { delete_older_than } => {
            let keep_days = (delete_older_than >= 0).then_some(delete_older_than);
            orchestrator.backup_system(keep_days).await?;
            println!("System backed up");
            Ok(())
        }
        Command::CollectStats => report("stats collection", orchestrator.collect_stats().await?),
        Command::Cleanup { execute, no_send_email } => {
            let cleanup = orchestrator.cleanup(!execute, !no_send_email).await?;
            for flagged in &cleanup.flagged {
                println!(
                    "{:<32} {:<10} {:<40} {:<32} {}",
                    flagged.tenant.tag,
                    flagged.tenant.service_type.as_str(),
                    flagged.tenant.hostname,
                    flagged.tenant.admin_email,
                    flagged.reason
                );
            }
            println!("{} site(s) flagged", cleanup.flagged.len());
            if execute {
                report("removal", cleanup.removed)
            } else {
                if !cleanup.flagged.is_empty() {
                    println!("Dry run; pass --execute to remove them");
                }
                Ok(())
            }
        }
        Command::Retry { tag } => {
            let ticket = orchestrator.retry_provision(&tag).await?;
            println!("Retrying provisioning of {tag}...");
            await_provisioning(services, ticket).await
        }
        Command::List {
            service,
            status,
            donors,
            not_installed,
            email,
            hostname,
            ip,
            skip,
            limit,
        } => {
            let filter = TenantFilter {
                service_type: service,
                status,
                donors_only: donors,
                not_installed,
                email_contains: email,
                hostname_contains: hostname,
                ip,
                skip,
                limit,
            };
            let tenants = services.tenants.list(&filter).await?;
            for tenant in &tenants {
                println!(
                    "{:<32} {:<10} {:<12} {:<40} {:<32} {:>8}",
                    tenant.tag,
                    tenant.service_type.as_str(),
                    tenant.state().to_string(),
                    tenant.hostname,
                    tenant.admin_email,
                    tenant.donated_amount.to_string()
                );
            }
            println!("{} site(s)", tenants.len());
            Ok(())
        }
        Command::Info { identifier } => {
            let tenant = services
                .tenants
                .get_by_identifier(&identifier, true)
                .await?
                .ok_or_else(|| Error::not_found("Site", &identifier))?;
            print_tenant(&tenant);
            Ok(())
        }
        Command::LinkDomain { hostname, identifier } => {
            let tenant = orchestrator.find_active(&identifier).await?;
            let hostname = normalize_hostname(&hostname);
            let allowed = orchestrator.router().allowed_domains();

            let change = if allowed.contains(&hostname) {
                orchestrator.unlink_custom_domain(&tenant.tag, &hostname).await?
            } else if crate::types::matching_parent_domain(&hostname, allowed).is_some() {
                orchestrator.change_hostname(&tenant.tag, &hostname).await?
            } else {
                orchestrator.link_custom_domain(&tenant.tag, &hostname).await?
            };

            println!("{}: {} -> {}", change.tenant.tag, change.old_hostname, change.tenant.hostname);
            if let Some(e) = change.routing_error {
                eprintln!("Warning: routing table not republished: {e}");
            }
            if let Some(e) = change.rewrite_error {
                eprintln!("Warning: embedded URLs were not rewritten: {e}");
            }
            Ok(())
        }
        Command::SyncRoutes => {
            let entries = orchestrator.sync_routes().await?;
            println!("Published {entries} route(s)");
            Ok(())
        }
        Command::Donate { identifier, amount } => {
            let credit = services.donations.record(&identifier, &amount).await?;
            println!("{} has donated {} in total", credit.tag, credit.total);
            if credit.perks_unlocked {
                println!("Perks unlocked");
            }
            if let Some(e) = credit.config_error {
                eprintln!("Warning: site configuration not refreshed: {e}");
            }
            Ok(())
        }
        Command::Reconcile => {
            let tickets = orchestrator.reconcile_once(services.config.worker.stale_after).await?;
            if tickets.is_empty() {
                println!("No stale sites");
            }
            let mut failed = 0;
            for ticket in tickets {
                println!("Resubmitted {}", ticket.tag());
                if await_provisioning(services, ticket).await.is_err() {
                    failed += 1;
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} site(s) failed to provision");
            }
            Ok(())
        }
        Command::Migrate => {
            println!("Migrations applied");
            Ok(())
        }
        Command::Serve => anyhow::bail!("serve cannot run as a one-shot command"),
    }
}

/// Wait for a provisioning ticket and turn a recorded failure into an error.
async fn await_provisioning(services: &Services, ticket: JobTicket) -> anyhow::Result<()> {
    let tag = ticket.tag().to_string();
    match ticket.wait().await? {
        Some(TenantState::Installed) => {
            println!("{tag} is installed");
            Ok(())
        }
        Some(TenantState::Failed) => {
            let failure = services.tenants.get(&tag).await?.and_then(|t| t.failure);
            match failure {
                Some(failure) => Err(Error::from(failure).into()),
                None => Err(Error::ExternalJob {
                    job: JobKind::Provision.as_str().to_string(),
                    exit_code: None,
                    failed_steps: Vec::new(),
                }
                .into()),
            }
        }
        Some(state) => {
            println!("{tag} is {state}");
            Ok(())
        }
        None => Err(Error::not_found("Site", &tag).into()),
    }
}

fn report(action: &str, report: BatchReport) -> anyhow::Result<()> {
    for tag in &report.succeeded {
        println!("{tag}: ok");
    }
    for (tag, e) in &report.failed {
        eprintln!("{tag}: {e}");
    }
    if !report.is_success() {
        anyhow::bail!(
            "{} of {} {action}s failed",
            report.failed.len(),
            report.failed.len() + report.succeeded.len()
        );
    }
    Ok(())
}

fn print_tenant(tenant: &Tenant) {
    println!("tag:            {}", tenant.tag);
    println!("service:        {}", tenant.service_type);
    println!("state:          {}", tenant.state());
    println!("hostname:       {}", tenant.hostname);
    println!("admin e-mail:   {}", tenant.admin_email);
    println!("created:        {}", tenant.created_at);
    if let Some(at) = tenant.installed_at {
        println!("installed:      {at}");
    }
    if let Some(failure) = &tenant.failure {
        println!("failed:         {} job, exit {:?}", failure.job, failure.exit_code);
        for step in &failure.failed_steps {
            println!("  - {} on {}: {}", step.step, step.host, step.message);
        }
    }
    if let Some(at) = tenant.removed_at {
        println!(
            "removed:        {at} ({})",
            tenant.removal_reason.as_deref().unwrap_or("no reason given")
        );
    }
    println!("donated:        {}", tenant.donated_amount);
    if let Some(at) = tenant.last_login_at {
        println!(
            "last login:     {at} from {}",
            tenant.last_login_ip.as_deref().unwrap_or("unknown")
        );
    }
}
