//! Test utilities for unit and integration testing (available with `test-utils` feature).

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::password::Argon2Params;
use crate::auth::tokens::TokenIssuer;
use crate::config::{Config, EmailConfig, EmailTransportConfig, RoutingConfig};
use crate::db::handlers::InMemoryTenants;
use crate::db::models::tenants::Tenant;
use crate::email::{Email, Mailer};
use crate::errors::Result;
use crate::jobs::{JobExecutor, JobKind, JobResult, JobSpec};
use crate::lifecycle::{Daemon, JobQueue, JobReceiver, Orchestrator};
use crate::routing::{DnsVerifier, DomainRouter, EdgeProxy};
use crate::types::ServiceType;

pub const TEST_SECRET: &str = "test-secret-key-for-capability-tokens";

/// An installed-looking, active tenant at `{tag}.example.com` with no donations
pub fn sample_tenant(tag: &str) -> Tenant {
    let now = Utc::now();
    Tenant {
        tag: tag.to_string(),
        service_type: ServiceType::Flarum,
        hostname: format!("{}.example.com", tag.to_lowercase()),
        admin_email: format!("{tag}@x.com"),
        admin_password_hash: "$argon2id$v=19$m=8,t=1,p=1$c2FsdHNhbHQ$aGFzaGhhc2g".to_string(),
        created_at: now,
        updated_at: now,
        installed_at: Some(now),
        failed_at: None,
        failure: None,
        removed_at: None,
        removal_reason: None,
        removed_ip: None,
        created_ip: Some("10.0.0.1".to_string()),
        last_login_at: None,
        last_login_ip: None,
        donated_amount: Decimal::ZERO,
    }
}

/// Config writing the routing map and e-mails under `dir`
pub fn test_config(dir: &Path) -> Config {
    Config {
        secret_key: Some(TEST_SECRET.to_string()),
        allowed_domains: vec!["example.com".to_string(), "example.org".to_string()],
        public_url: Some("https://example.com".to_string()),
        password_hashing: Argon2Params::insecure_fast(),
        routing: RoutingConfig {
            map_path: dir.join("tenants.map"),
            reload_command: Vec::new(),
            ..Default::default()
        },
        email: EmailConfig {
            transport: EmailTransportConfig::File {
                path: dir.join("emails").to_string_lossy().into_owned(),
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Job executor that records every spec and plays back scripted results.
///
/// Specs are validated like the real runner does, so an invalid one is rejected without being
/// recorded. Kinds without a scripted result succeed.
#[derive(Default)]
pub struct ScriptedJobExecutor {
    calls: Mutex<Vec<JobSpec>>,
    scripted: Mutex<HashMap<JobKind, VecDeque<Result<JobResult>>>>,
    held: Mutex<HashMap<JobKind, Arc<Notify>>>,
}

impl ScriptedJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next run of `kind`
    pub fn script(&self, kind: JobKind, result: Result<JobResult>) {
        self.scripted.lock().entry(kind).or_default().push_back(result);
    }

    /// Make runs of `kind` block until the returned handle is notified once per run.
    pub fn hold(&self, kind: JobKind) -> Arc<Notify> {
        self.held.lock().entry(kind).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    pub fn calls(&self) -> Vec<JobSpec> {
        self.calls.lock().clone()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.calls.lock().iter().map(JobSpec::kind).collect()
    }

    pub fn count(&self, kind: JobKind) -> usize {
        self.calls.lock().iter().filter(|s| s.kind() == kind).count()
    }
}

#[async_trait]
impl JobExecutor for ScriptedJobExecutor {
    async fn run(&self, spec: &JobSpec) -> Result<JobResult> {
        spec.validate()?;
        self.calls.lock().push(spec.clone());

        let gate = self.held.lock().get(&spec.kind()).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let next = self.scripted.lock().get_mut(&spec.kind()).and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(JobResult::success()))
    }
}

/// Mailer that keeps every message in memory
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, Email)>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<(String, Email)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, email: &Email) -> Result<()> {
        self.sent.lock().push((to.to_string(), email.clone()));
        Ok(())
    }
}

/// Edge proxy that only counts reloads
#[derive(Default)]
pub struct RecordingProxy {
    reloads: AtomicUsize,
}

impl RecordingProxy {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EdgeProxy for RecordingProxy {
    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// DNS verifier with a fixed set of correctly pointed domains
#[derive(Default)]
pub struct StaticDnsVerifier {
    pointing: BTreeSet<String>,
}

impl StaticDnsVerifier {
    pub fn pointing(domains: &[&str]) -> Self {
        Self {
            pointing: domains.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[async_trait]
impl DnsVerifier for StaticDnsVerifier {
    async fn points_to(&self, domain: &str, _target: &str) -> Result<bool> {
        Ok(self.pointing.contains(domain))
    }
}

/// A fully wired orchestrator over in-memory collaborators
pub struct TestHarness {
    pub config: Config,
    pub repo: InMemoryTenants,
    pub jobs: Arc<ScriptedJobExecutor>,
    pub proxy: Arc<RecordingProxy>,
    pub mailer: Arc<RecordingMailer>,
    pub tokens: Arc<TokenIssuer>,
    pub router: Arc<DomainRouter>,
    pub orchestrator: Arc<Orchestrator>,
    receiver: Option<JobReceiver>,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_dns(StaticDnsVerifier::default())
    }

    pub fn with_dns(dns: StaticDnsVerifier) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = test_config(dir.path());
        let repo = InMemoryTenants::new();
        let jobs = Arc::new(ScriptedJobExecutor::new());
        let proxy = Arc::new(RecordingProxy::default());
        let tokens = Arc::new(TokenIssuer::new(TEST_SECRET, config.tokens.clone()));
        let router = Arc::new(DomainRouter::new(&config, Arc::new(repo.clone()), proxy.clone(), Arc::new(dns)));
        let (queue, receiver) = JobQueue::channel();
        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            Arc::new(repo.clone()),
            jobs.clone(),
            router.clone(),
            tokens.clone(),
            queue,
        ));

        Self {
            config,
            repo,
            jobs,
            proxy,
            mailer: Arc::new(RecordingMailer::default()),
            tokens,
            router,
            orchestrator,
            receiver: Some(receiver),
            dir,
        }
    }

    /// Spawn the provisioning worker without the periodic sweep.
    pub fn start_worker(&mut self) -> (CancellationToken, JoinHandle<()>) {
        let receiver = self.receiver.take().expect("worker already started");
        let daemon = Daemon::new(self.orchestrator.clone(), receiver, &self.config.worker).without_sweep();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone()));
        (shutdown, handle)
    }

    /// Take the raw queue receiver, for tests that drive the worker themselves.
    pub fn take_receiver(&mut self) -> JobReceiver {
        self.receiver.take().expect("worker already started")
    }

    pub fn routing_map(&self) -> String {
        std::fs::read_to_string(&self.config.routing.map_path).unwrap_or_default()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
