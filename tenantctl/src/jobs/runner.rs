//! Subprocess job executor.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{FailedStep, JobExecutor, JobResult, JobSpec, JobStatus, events::parse_failed_steps};
use crate::config::JobsConfig;
use crate::errors::{Error, Result};
use crate::types::abbrev_uuid;

/// Runs jobs as `{program} {args...} {playbooks_dir}/{playbook} [--tags T] --extra-vars JSON`.
#[derive(Debug, Clone)]
pub struct CommandJobExecutor {
    config: JobsConfig,
}

impl CommandJobExecutor {
    pub fn new(config: JobsConfig) -> Self {
        Self { config }
    }

    /// Platform vars overlaid by the job's own parameters
    fn extra_vars(&self, spec: &JobSpec) -> Result<String> {
        let mut vars: Map<String, Value> = self
            .config
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        for (key, value) in spec.params() {
            vars.insert(key.to_string(), serde_json::to_value(value).map_err(anyhow::Error::from)?);
        }
        Ok(Value::Object(vars).to_string())
    }

    fn command(&self, spec: &JobSpec) -> Result<Command> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(self.config.playbooks_dir.join(spec.playbook()));
        if let Some(tags) = spec.tags() {
            cmd.arg("--tags").arg(tags);
        }
        cmd.arg("--extra-vars").arg(self.extra_vars(spec)?);
        cmd.envs(&self.config.env);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl JobExecutor for CommandJobExecutor {
    #[instrument(skip(self, spec), fields(job = %spec.kind(), tag = spec.tag(), run_id), err)]
    async fn run(&self, spec: &JobSpec) -> Result<JobResult> {
        spec.validate()?;

        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", abbrev_uuid(&run_id).as_str());

        let mut cmd = self.command(spec)?;
        let started = Instant::now();
        debug!(playbook = spec.playbook(), tags = ?spec.tags(), "Launching job");

        let output = match tokio::time::timeout(self.config.timeout, cmd.output()).await {
            Ok(output) => output.map_err(|e| Error::Internal {
                operation: format!("launch {} job: {e}", spec.kind()),
            })?,
            Err(_) => {
                // Dropping the output future kills the child.
                warn!(timeout = ?self.config.timeout, "Job exceeded its time limit");
                let mut result = JobResult::failed(
                    None,
                    vec![FailedStep {
                        step: "timeout".to_string(),
                        host: "localhost".to_string(),
                        message: format!("job exceeded {}", humantime::format_duration(self.config.timeout)),
                    }],
                );
                result.elapsed = started.elapsed();
                return Ok(result);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();
        let elapsed = started.elapsed();

        if output.status.success() {
            info!(elapsed = ?elapsed, "Job succeeded");
            return Ok(JobResult {
                status: JobStatus::Success,
                exit_code,
                stdout,
                stderr,
                failed_steps: Vec::new(),
                elapsed,
            });
        }

        let mut failed_steps = parse_failed_steps(&stdout);
        if failed_steps.is_empty() {
            let message = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("exited with {}", output.status));
            failed_steps.push(FailedStep {
                step: spec.playbook().to_string(),
                host: "localhost".to_string(),
                message,
            });
        }
        warn!(exit_code = ?exit_code, failed_steps = failed_steps.len(), elapsed = ?elapsed, "Job failed");

        Ok(JobResult {
            status: JobStatus::Failed,
            exit_code,
            stdout,
            stderr,
            failed_steps,
            elapsed,
        })
    }
}
