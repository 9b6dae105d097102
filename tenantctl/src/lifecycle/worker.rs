//! Provisioning queue and background worker.
//!
//! Signup only records the tenant and enqueues a [`ProvisionRequest`]; the [`Daemon`] runs the
//! provisioning job outside of any request and records the outcome on the tenant. Delivery is
//! at-least-once: a request lost to a crash is picked up again by the reconciliation sweep,
//! which resubmits tenants that have been provisioning for longer than `stale_after`.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Orchestrator;
use crate::config::WorkerConfig;
use crate::db::models::tenants::TenantState;
use crate::errors::{Error, Result};

/// Run the provisioning job for one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub tag: String,
    /// Overwrite leftovers of an earlier attempt
    pub force: bool,
    pub send_email: bool,
}

/// Final state of a provisioning attempt; `None` if the tenant vanished meanwhile
pub type ProvisionOutcome = Option<TenantState>;

struct QueuedJob {
    request: ProvisionRequest,
    done: oneshot::Sender<Result<ProvisionOutcome>>,
}

/// Handle for awaiting a queued provisioning attempt. Dropping it does not cancel anything.
pub struct JobTicket {
    tag: String,
    rx: oneshot::Receiver<Result<ProvisionOutcome>>,
}

impl JobTicket {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn wait(self) -> Result<ProvisionOutcome> {
        self.rx.await.map_err(|_| Error::Internal {
            operation: format!("finish provisioning {}: worker stopped", self.tag),
        })?
    }
}

/// Sending side of the provisioning queue
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
}

/// Receiving side, consumed by [`Daemon`]
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<QueuedJob>,
}

impl JobQueue {
    pub fn channel() -> (JobQueue, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobQueue { tx }, JobReceiver { rx })
    }

    pub fn submit(&self, request: ProvisionRequest) -> Result<JobTicket> {
        let (done, rx) = oneshot::channel();
        let tag = request.tag.clone();
        self.tx.send(QueuedJob { request, done }).map_err(|_| Error::Internal {
            operation: format!("schedule provisioning of {tag}: worker is not running"),
        })?;
        Ok(JobTicket { tag, rx })
    }
}

/// Background provisioning worker with bounded concurrency
pub struct Daemon {
    orchestrator: Arc<Orchestrator>,
    receiver: JobReceiver,
    concurrency: usize,
    sweep_interval: Duration,
    stale_after: Duration,
    sweep_enabled: bool,
    in_flight: Arc<DashMap<String, ()>>,
}

impl Daemon {
    pub fn new(orchestrator: Arc<Orchestrator>, receiver: JobReceiver, config: &WorkerConfig) -> Self {
        Self {
            orchestrator,
            receiver,
            concurrency: config.concurrency.max(1),
            sweep_interval: config.sweep_interval,
            stale_after: config.stale_after,
            sweep_enabled: true,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// One-shot CLI runs only process what they submit themselves.
    pub fn without_sweep(mut self) -> Self {
        self.sweep_enabled = false;
        self
    }

    /// Process queued jobs until `shutdown` fires, then wait for running jobs to finish.
    ///
    /// Running jobs are never interrupted; the external job timeout bounds them.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(concurrency = self.concurrency, sweep = self.sweep_enabled, "Provisioning worker started");

        loop {
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    error!(error = %join_error, "Provisioning task panicked");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick(), if self.sweep_enabled => {
                    match self.orchestrator.reconcile_once(self.stale_after).await {
                        // Nobody waits on sweep tickets.
                        Ok(tickets) if !tickets.is_empty() => info!(count = tickets.len(), "Resubmitted stale tenants"),
                        Ok(_) => debug!("No stale tenants"),
                        Err(e) => warn!(error = %e, "Reconciliation sweep failed"),
                    }
                }
                job = self.receiver.rx.recv() => {
                    let Some(job) = job else { break };
                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => {
                            let _ = job.done.send(Err(Error::Internal {
                                operation: format!("provision {}: worker is shutting down", job.request.tag),
                            }));
                            break;
                        }
                        permit = semaphore.clone().acquire_owned() => permit,
                    };
                    let Ok(permit) = permit else { break };
                    self.dispatch(&mut join_set, job, permit);
                }
            }
        }

        if !join_set.is_empty() {
            info!(running = join_set.len(), "Waiting for running provisioning jobs");
        }
        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                error!(error = %join_error, "Provisioning task panicked");
            }
        }
        info!("Provisioning worker stopped");
    }

    fn dispatch(&self, join_set: &mut JoinSet<()>, job: QueuedJob, permit: tokio::sync::OwnedSemaphorePermit) {
        let QueuedJob { request, done } = job;
        let tag = request.tag.clone();

        if self.in_flight.insert(tag.clone(), ()).is_some() {
            debug!(tag = %tag, "Provisioning already in flight, dropping duplicate");
            let _ = done.send(Err(Error::conflict(format!("Site '{tag}' is already being provisioned."))));
            return;
        }

        let orchestrator = self.orchestrator.clone();
        let in_flight = self.in_flight.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let _guard = scopeguard::guard(tag, move |tag| {
                in_flight.remove(&tag);
            });

            let result = orchestrator.provision(&request).await;
            if let Err(e) = &result {
                error!(tag = %request.tag, error = %e, "Provisioning attempt errored");
            }
            // The submitter may have stopped waiting.
            let _ = done.send(result);
        });
    }
}
