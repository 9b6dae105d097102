//! # tenantctl: Tenant Lifecycle Control Plane
//!
//! `tenantctl` runs the life of every site on a multi-tenant hosting platform: signup records a
//! tenant and queues its provisioning, a background worker runs the provisioning job, and the
//! operator CLI drives removal, backups, restores, upgrades and hostname changes. The hostname
//! to site table consumed by the edge proxy is kept in step with every transition.
//!
//! ## Architecture
//!
//! ```text
//!  CLI / HTTP ──► Orchestrator ──► JobExecutor ──► external playbooks
//!                     │    │
//!                     │    └──────► DomainRouter ──► routing map + proxy reload
//!                     ▼
//!              TenantRepository (PostgreSQL)
//! ```
//!
//! ### Core Components
//!
//! The **lifecycle layer** ([`lifecycle`]) owns the tenant state machine, the per-tag locks and the
//! provisioning queue with its worker daemon and reconciliation sweep.
//!
//! The **job layer** ([`jobs`]) turns typed job specs into subprocess invocations and reports a
//! structured [`jobs::JobResult`], failed steps included.
//!
//! The **routing layer** ([`routing`]) rebuilds and atomically publishes the routing map and
//! verifies custom domains.
//!
//! The **database layer** ([`db`]) hides tenant persistence behind [`db::handlers::TenantRepository`],
//! with a PostgreSQL implementation and an in-memory one with the same semantics.
//!
//! Capability tokens ([`auth::tokens`]) authorize one-shot actions such as password resets; the
//! [`account`] and [`donations`] modules build on them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tenantctl::{Application, Config};
//!
//! # async fn run(config: Config) -> anyhow::Result<()> {
//! let app = Application::new(config).await?;
//! app.serve(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod account;
pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod db;
pub mod donations;
pub mod email;
pub mod errors;
pub mod jobs;
pub mod lifecycle;
pub mod routing;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use bon::Builder;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::Config;

use crate::account::AccountService;
use crate::auth::tokens::TokenIssuer;
use crate::db::handlers::{PostgresTenants, TenantRepository};
use crate::donations::DonationLedger;
use crate::email::{EmailService, Mailer};
use crate::jobs::{CommandJobExecutor, JobExecutor};
use crate::lifecycle::{Daemon, JobQueue, JobReceiver, Orchestrator, TagLocks};
use crate::routing::{CommandReload, DnsVerifier, DomainRouter, EdgeProxy, NoReload, SystemDnsVerifier};

/// Shared state of the HTTP surface
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub donations: Arc<DonationLedger>,
}

/// The outside world the services talk to
#[derive(Builder)]
pub struct Collaborators {
    pub tenants: Arc<dyn TenantRepository>,
    pub jobs: Arc<dyn JobExecutor>,
    pub proxy: Arc<dyn EdgeProxy>,
    pub dns: Arc<dyn DnsVerifier>,
    pub mailer: Arc<dyn Mailer>,
    /// Closed on shutdown when present
    pub pool: Option<PgPool>,
}

/// Every service wired to one set of collaborators
pub struct Services {
    pub config: Config,
    pub tenants: Arc<dyn TenantRepository>,
    pub orchestrator: Arc<Orchestrator>,
    pub accounts: Arc<AccountService>,
    pub donations: Arc<DonationLedger>,
    pool: Option<PgPool>,
    receiver: Option<JobReceiver>,
}

impl Services {
    pub fn new(config: Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        let Collaborators {
            tenants,
            jobs,
            proxy,
            dns,
            mailer,
            pool,
        } = collaborators;

        let tokens = Arc::new(TokenIssuer::from_config(&config)?);
        let router = Arc::new(DomainRouter::new(&config, tenants.clone(), proxy, dns));
        let (queue, receiver) = JobQueue::channel();
        let locks = pool.clone().map_or_else(TagLocks::new, TagLocks::with_postgres);
        let orchestrator = Arc::new(
            Orchestrator::new(&config, tenants.clone(), jobs.clone(), router, tokens.clone(), queue)
                .with_locks(locks),
        );
        let accounts = Arc::new(AccountService::new(&config, tenants.clone(), tokens, mailer.clone()));
        let donations = Arc::new(DonationLedger::new(&config, tenants.clone(), jobs, mailer));

        Ok(Self {
            config,
            tenants,
            orchestrator,
            accounts,
            donations,
            pool,
            receiver: Some(receiver),
        })
    }

    /// Connect to PostgreSQL, apply migrations and wire the production collaborators.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let pool = db::create_pool(&config.database_url, &config.database_pool).await?;
        db::migrator().run(&pool).await?;
        debug!("Database migrations applied");

        let proxy: Arc<dyn EdgeProxy> = match CommandReload::from_config(&config.routing) {
            Some(reload) => Arc::new(reload),
            None => {
                warn!("No reload command configured; the edge proxy must pick up map changes itself");
                Arc::new(NoReload)
            }
        };

        let collaborators = Collaborators::builder()
            .tenants(Arc::new(PostgresTenants::new(pool.clone())))
            .jobs(Arc::new(CommandJobExecutor::new(config.jobs.clone())))
            .proxy(proxy)
            .dns(Arc::new(SystemDnsVerifier))
            .mailer(Arc::new(EmailService::new(&config.email)?))
            .pool(pool)
            .build();

        Self::new(config, collaborators)
    }

    pub fn app_state(&self) -> AppState {
        AppState::builder()
            .config(self.config.clone())
            .donations(self.donations.clone())
            .build()
    }

    /// Start the provisioning worker. Only one worker can consume the queue.
    pub fn start_worker(&mut self, shutdown: CancellationToken, sweep: bool) -> anyhow::Result<JoinHandle<()>> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| anyhow::anyhow!("provisioning worker already started"))?;

        let daemon = Daemon::new(self.orchestrator.clone(), receiver, &self.config.worker);
        let daemon = if sweep { daemon } else { daemon.without_sweep() };
        Ok(tokio::spawn(daemon.run(shutdown)))
    }

    pub async fn close(self) {
        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }
    }
}

/// The long-running daemon: provisioning worker, reconciliation sweep and HTTP surface.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] connects, migrates and wires every service
/// 2. **Serve**: [`Application::serve`] republishes routing, starts the worker and serves HTTP
/// 3. **Shutdown**: the worker stops taking jobs and running jobs finish before exit
pub struct Application {
    services: Services,
    router: axum::Router,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting tenantctl with configuration: {:#?}", config);
        let services = Services::connect(config).await?;
        let router = api::build_router(services.app_state());
        Ok(Self { services, router })
    }

    pub async fn serve<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        // The map may have drifted while nobody was running.
        if let Err(e) = self.services.orchestrator.sync_routes().await {
            warn!(error = %e, "Initial routing table sync failed");
        }

        let shutdown_token = CancellationToken::new();
        let worker = self.services.start_worker(shutdown_token.clone(), true)?;

        let bind_addr = self.services.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("tenantctl listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Stopping provisioning worker...");
        shutdown_token.cancel();
        if let Err(e) = worker.await {
            warn!(error = %e, "Provisioning worker ended abnormally");
        }

        self.services.close().await;
        Ok(())
    }
}
