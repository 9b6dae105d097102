//! Which installed sites the cleanup run removes.
//!
//! Sites are judged only by their latest usage snapshot. One far above the platform's limits
//! is treated as abusive, one with next to nothing on it as abandoned. Age and donor checks
//! happen in [`super::Orchestrator::cleanup`]; this module only reads the numbers.

use crate::config::CleanupConfig;
use crate::db::models::stats::SiteStats;
use crate::db::models::tenants::Tenant;

/// A site the cleanup run picked, with the reason it was picked
#[derive(Debug, Clone)]
pub struct Flagged {
    pub tenant: Tenant,
    pub stats: SiteStats,
    pub reason: String,
}

/// Reason to remove a site with these numbers, if any
pub fn classify(stats: &SiteStats, limits: &CleanupConfig) -> Option<String> {
    if stats.content_count > limits.max_content
        || stats.user_count > limits.max_users
        || stats.assets_mb > limits.max_assets_mb
    {
        return Some(format!(
            "too active (content={}, users={}, assets={:.1}MB)",
            stats.content_count, stats.user_count, stats.assets_mb
        ));
    }

    if stats.content_count < limits.min_content || stats.user_count <= limits.min_users {
        return Some(format!(
            "inactive (content={}, users={})",
            stats.content_count, stats.user_count
        ));
    }

    None
}
