//! Usage snapshots of installed sites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One collection run's numbers for one site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteStats {
    pub tag: String,
    /// Posts, pages or articles, depending on the service
    pub content_count: i64,
    pub user_count: i64,
    /// Size of uploaded files
    pub assets_mb: f64,
    pub collected_at: DateTime<Utc>,
}
