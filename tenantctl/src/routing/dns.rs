//! Custom domain DNS verification.
//!
//! A custom domain is accepted when it resolves to at least one of the addresses the platform's
//! CNAME target resolves to. Comparing resolved addresses covers CNAME records as well as
//! A/ALIAS records that point at the same edge.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, instrument};

use crate::errors::{Error, Result};

#[async_trait]
pub trait DnsVerifier: Send + Sync {
    /// True if `domain` routes to `target`
    async fn points_to(&self, domain: &str, target: &str) -> Result<bool>;
}

/// Verifier backed by the system resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDnsVerifier;

async fn resolve(host: &str) -> std::io::Result<HashSet<IpAddr>> {
    Ok(tokio::net::lookup_host((host, 0)).await?.map(|addr| addr.ip()).collect())
}

#[async_trait]
impl DnsVerifier for SystemDnsVerifier {
    #[instrument(skip(self), err)]
    async fn points_to(&self, domain: &str, target: &str) -> Result<bool> {
        let target_ips = resolve(target).await.map_err(|e| Error::Internal {
            operation: format!("resolve CNAME target {target}: {e}"),
        })?;

        // An unresolvable domain simply does not point at us yet.
        let domain_ips = match resolve(domain).await {
            Ok(ips) => ips,
            Err(e) => {
                debug!(error = %e, "Custom domain does not resolve");
                return Ok(false);
            }
        };

        Ok(!domain_ips.is_disjoint(&target_ips))
    }
}
