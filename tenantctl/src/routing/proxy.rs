//! Edge proxy reload trigger.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::RoutingConfig;
use crate::errors::{Error, Result};

/// Tells the edge proxy to pick up a freshly published routing map
#[async_trait]
pub trait EdgeProxy: Send + Sync {
    async fn reload(&self) -> Result<()>;
}

/// Runs a reload command such as `nginx -s reload`
#[derive(Debug, Clone)]
pub struct CommandReload {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandReload {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    /// `None` when reloading is disabled (empty command)
    pub fn from_config(config: &RoutingConfig) -> Option<Self> {
        if config.reload_command.is_empty() {
            None
        } else {
            Some(Self::new(config.reload_command.clone(), config.reload_timeout))
        }
    }
}

#[async_trait]
impl EdgeProxy for CommandReload {
    #[instrument(skip(self), fields(command = ?self.command), err)]
    async fn reload(&self) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(());
        };

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| Error::Internal {
                operation: format!("reload edge proxy: timed out after {}", humantime::format_duration(self.timeout)),
            })?
            .map_err(|e| Error::Internal {
                operation: format!("reload edge proxy: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Internal {
                operation: format!("reload edge proxy: {} ({})", output.status, stderr.trim()),
            });
        }
        debug!("Edge proxy reloaded");
        Ok(())
    }
}

/// Publishing the map is enough (the proxy watches the file, or there is no proxy)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReload;

#[async_trait]
impl EdgeProxy for NoReload {
    async fn reload(&self) -> Result<()> {
        Ok(())
    }
}
