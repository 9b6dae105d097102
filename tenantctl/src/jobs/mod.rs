//! Supervised execution of external lifecycle jobs.
//!
//! A job is one opaque, potentially slow operation (provision, remove, backup, restore,
//! upgrade, URL rewrite, stats collection) run by an external executor. The orchestrator only ever sees a
//! [`JobSpec`] going in and a [`JobResult`] coming out:
//!
//! - [`spec`]: the closed set of job kinds, each with a typed, validated parameter set that is
//!   flattened to scalar key/value pairs at the boundary
//! - [`events`]: extraction of failed steps and reported site stats from the executor's JSON
//!   event stream
//! - [`runner`]: the subprocess executor with a bounded wait
//!
//! The runner never retries and never interprets what a failure means for the tenant; that is
//! left to the lifecycle layer.

pub mod events;
pub mod runner;
pub mod spec;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Error, Result};

pub use runner::CommandJobExecutor;
pub use spec::{BackupMode, JobKind, JobSpec, ParamValue, RestoreSource};

/// One failed task reported by the job's event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub step: String,
    pub host: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
}

/// Structured outcome of one job run
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub failed_steps: Vec<FailedStep>,
    pub elapsed: Duration,
}

impl JobResult {
    pub fn success() -> Self {
        Self {
            status: JobStatus::Success,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            failed_steps: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(exit_code: Option<i32>, failed_steps: Vec<FailedStep>) -> Self {
        Self {
            status: JobStatus::Failed,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            failed_steps,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }

    /// The persisted summary of a failed run
    pub fn failure(&self, kind: JobKind) -> JobFailure {
        JobFailure {
            job: kind.as_str().to_string(),
            exit_code: self.exit_code,
            failed_steps: self.failed_steps.clone(),
        }
    }

    /// Turn a failed result into [`Error::ExternalJob`].
    pub fn into_result(self, kind: JobKind) -> Result<JobResult> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.failure(kind).into())
        }
    }
}

/// What gets recorded on a tenant whose job failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job: String,
    pub exit_code: Option<i32>,
    pub failed_steps: Vec<FailedStep>,
}

impl JobFailure {
    /// True if any failed step mentions `needle` (case-insensitive)
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.failed_steps.iter().any(|s| s.message.to_lowercase().contains(&needle))
    }
}

impl From<JobFailure> for Error {
    fn from(failure: JobFailure) -> Self {
        Error::ExternalJob {
            job: failure.job,
            exit_code: failure.exit_code,
            failed_steps: failure.failed_steps,
        }
    }
}

/// Executes one job and reports its structured outcome.
///
/// `Err` is reserved for jobs that could not be launched at all (invalid parameters, missing
/// binary); a job that ran and failed is an `Ok` result with [`JobStatus::Failed`].
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(&self, spec: &JobSpec) -> Result<JobResult>;

    /// Run and convert a failed result into [`Error::ExternalJob`]
    async fn run_to_success(&self, spec: &JobSpec) -> Result<JobResult> {
        self.run(spec).await?.into_result(spec.kind())
    }
}
