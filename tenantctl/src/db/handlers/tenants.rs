//! PostgreSQL tenant repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, QueryBuilder, types::Json};
use std::collections::HashMap;
use tracing::{info, instrument};

use super::repository::{DONATION_CONSTRAINT, TenantRepository};
use crate::db::errors::{DbError, Result};
use crate::db::models::stats::SiteStats;
use crate::db::models::tenants::{NewTenant, StatusFilter, Tenant, TenantFilter, TenantUpdate};
use crate::jobs::JobFailure;
use crate::types::ServiceType;

// Database entity model for a tenant row
#[derive(Debug, Clone, FromRow)]
struct TenantRow {
    pub tag: String,
    pub service_type: String,
    pub hostname: String,
    pub admin_email: String,
    pub admin_password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub installed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure: Option<Json<JobFailure>>,
    pub removed_at: Option<DateTime<Utc>>,
    pub removal_reason: Option<String>,
    pub removed_ip: Option<String>,
    pub created_ip: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub donated_amount: Decimal,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = DbError;

    fn try_from(row: TenantRow) -> Result<Self> {
        let service_type: ServiceType = row
            .service_type
            .parse()
            .map_err(|_| DbError::Other(anyhow::anyhow!("unknown service type '{}' on tenant {}", row.service_type, row.tag)))?;
        Ok(Tenant {
            tag: row.tag,
            service_type,
            hostname: row.hostname,
            admin_email: row.admin_email,
            admin_password_hash: row.admin_password_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
            installed_at: row.installed_at,
            failed_at: row.failed_at,
            failure: row.failure.map(|Json(f)| f),
            removed_at: row.removed_at,
            removal_reason: row.removal_reason,
            removed_ip: row.removed_ip,
            created_ip: row.created_ip,
            last_login_at: row.last_login_at,
            last_login_ip: row.last_login_ip,
            donated_amount: row.donated_amount,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct SiteStatsRow {
    pub tag: String,
    pub content_count: i64,
    pub user_count: i64,
    pub assets_mb: f64,
    pub collected_at: DateTime<Utc>,
}

impl From<SiteStatsRow> for SiteStats {
    fn from(row: SiteStatsRow) -> Self {
        SiteStats {
            tag: row.tag,
            content_count: row.content_count,
            user_count: row.user_count,
            assets_mb: row.assets_mb,
            collected_at: row.collected_at,
        }
    }
}

fn into_tenants(rows: Vec<TenantRow>) -> Result<Vec<Tenant>> {
    rows.into_iter().map(Tenant::try_from).collect()
}

/// Tenant repository over a connection pool.
///
/// Each call runs on its own connection; multi-statement operations open a transaction.
#[derive(Debug, Clone)]
pub struct PostgresTenants {
    pool: PgPool,
}

impl PostgresTenants {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRepository for PostgresTenants {
    #[instrument(skip(self), err)]
    async fn get(&self, tag: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE tag = $1")
            .bind(tag)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Tenant::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn get_by_identifier(&self, identifier: &str, match_removed: bool) -> Result<Option<Tenant>> {
        let row = sqlx::query_as::<_, TenantRow>(
            r#"
            SELECT * FROM tenants
            WHERE (tag = $1 OR hostname = LOWER($1) OR LOWER(admin_email) = LOWER($1))
              AND ($2 OR removed_at IS NULL)
            ORDER BY
                (removed_at IS NULL) DESC,
                CASE WHEN tag = $1 THEN 0 WHEN hostname = LOWER($1) THEN 1 ELSE 2 END,
                created_at DESC
            LIMIT 1
            "#,
        )
        .bind(identifier)
        .bind(match_removed)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Tenant::try_from).transpose()
    }

    #[instrument(skip(self, filter), fields(status = ?filter.status, skip = filter.skip, limit = ?filter.limit), err)]
    async fn list(&self, filter: &TenantFilter) -> Result<Vec<Tenant>> {
        let mut query = QueryBuilder::new("SELECT * FROM tenants WHERE 1=1");

        match filter.status {
            StatusFilter::Active => {
                query.push(" AND removed_at IS NULL");
            }
            StatusFilter::Removed => {
                query.push(" AND removed_at IS NOT NULL");
            }
            StatusFilter::All => {}
        }

        if let Some(service_type) = filter.service_type {
            query.push(" AND service_type = ");
            query.push_bind(service_type.as_str());
        }

        if filter.donors_only {
            query.push(" AND donated_amount > 0");
        }

        if filter.not_installed {
            query.push(" AND installed_at IS NULL");
        }

        if let Some(email) = &filter.email_contains {
            query.push(" AND STRPOS(LOWER(admin_email), LOWER(");
            query.push_bind(email.clone());
            query.push(")) > 0");
        }

        if let Some(hostname) = &filter.hostname_contains {
            query.push(" AND STRPOS(hostname, LOWER(");
            query.push_bind(hostname.clone());
            query.push(")) > 0");
        }

        if let Some(ip) = &filter.ip {
            query.push(" AND (created_ip = ");
            query.push_bind(ip.clone());
            query.push(" OR last_login_ip = ");
            query.push_bind(ip.clone());
            query.push(")");
        }

        query.push(" ORDER BY tag OFFSET ");
        query.push_bind(filter.skip);

        if let Some(limit) = filter.limit {
            query.push(" LIMIT ");
            query.push_bind(limit);
        }

        let rows = query.build_query_as::<TenantRow>().fetch_all(&self.pool).await?;
        into_tenants(rows)
    }

    #[instrument(skip(self, tenant), fields(tag = %tenant.tag, hostname = %tenant.hostname), err)]
    async fn insert(&self, tenant: &NewTenant) -> Result<Tenant> {
        let mut tx = self.pool.begin().await?;

        let purged = sqlx::query("DELETE FROM tenants WHERE tag = $1 AND removed_at IS NOT NULL")
            .bind(&tenant.tag)
            .execute(&mut *tx)
            .await?;
        if purged.rows_affected() > 0 {
            info!("Purged removed tenant to reclaim its tag");
        }

        let row = sqlx::query_as::<_, TenantRow>(
            r#"
            INSERT INTO tenants (tag, service_type, hostname, admin_email, admin_password_hash, created_ip)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&tenant.tag)
        .bind(tenant.service_type.as_str())
        .bind(&tenant.hostname)
        .bind(&tenant.admin_email)
        .bind(&tenant.admin_password_hash)
        .bind(&tenant.created_ip)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Tenant::try_from(row)
    }

    #[instrument(skip(self, update), err)]
    async fn update(&self, tag: &str, update: &TenantUpdate) -> Result<Tenant> {
        let mut query = QueryBuilder::new("UPDATE tenants SET updated_at = NOW()");

        if let Some(hostname) = &update.hostname {
            query.push(", hostname = ");
            query.push_bind(hostname.clone());
        }
        if let Some(email) = &update.admin_email {
            query.push(", admin_email = ");
            query.push_bind(email.clone());
        }
        if let Some(hash) = &update.admin_password_hash {
            query.push(", admin_password_hash = ");
            query.push_bind(hash.clone());
        }
        if let Some((at, ip)) = &update.last_login {
            query.push(", last_login_at = ");
            query.push_bind(*at);
            query.push(", last_login_ip = ");
            query.push_bind(ip.clone());
        }

        query.push(" WHERE tag = ");
        query.push_bind(tag.to_string());
        query.push(" AND removed_at IS NULL RETURNING *");

        let row = query
            .build_query_as::<TenantRow>()
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound)?;
        Tenant::try_from(row)
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, tag: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenants WHERE tag = $1")
            .bind(tag)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn mark_installed(&self, tag: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET installed_at = $2, failed_at = NULL, failure = NULL, updated_at = NOW()
            WHERE tag = $1 AND installed_at IS NULL AND removed_at IS NULL
            "#,
        )
        .bind(tag)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, failure), fields(job = %failure.job), err)]
    async fn mark_failed(&self, tag: &str, failure: &JobFailure, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET failed_at = $2, failure = $3, updated_at = NOW()
            WHERE tag = $1 AND installed_at IS NULL AND failed_at IS NULL AND removed_at IS NULL
            "#,
        )
        .bind(tag)
        .bind(at)
        .bind(Json(failure))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn clear_failure(&self, tag: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET failed_at = NULL, failure = NULL, updated_at = NOW()
            WHERE tag = $1 AND failed_at IS NOT NULL AND installed_at IS NULL AND removed_at IS NULL
            "#,
        )
        .bind(tag)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, reason, ip), err)]
    async fn mark_removed(&self, tag: &str, reason: &str, ip: Option<&str>, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET removed_at = $2, removal_reason = $3, removed_ip = $4, updated_at = NOW()
            WHERE tag = $1 AND removed_at IS NULL
            "#,
        )
        .bind(tag)
        .bind(at)
        .bind(reason)
        .bind(ip)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(amount = %amount), err)]
    async fn add_donation(&self, tag: &str, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(DbError::CheckViolation {
                constraint: Some(DONATION_CONSTRAINT.to_string()),
                table: Some("tenants".to_string()),
                message: format!("donation amount must be positive, got {amount}"),
            });
        }

        let total: Option<Decimal> = sqlx::query_scalar(
            r#"
            UPDATE tenants
            SET donated_amount = donated_amount + $2, updated_at = NOW()
            WHERE tag = $1 AND removed_at IS NULL
            RETURNING donated_amount
            "#,
        )
        .bind(tag)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        total.ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), err)]
    async fn list_stale_provisioning(&self, updated_before: DateTime<Utc>) -> Result<Vec<Tenant>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            r#"
            SELECT * FROM tenants
            WHERE installed_at IS NULL AND failed_at IS NULL AND removed_at IS NULL AND updated_at < $1
            ORDER BY updated_at
            "#,
        )
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;
        into_tenants(rows)
    }

    #[instrument(skip(self, stats), fields(tag = %stats.tag), err)]
    async fn record_stats(&self, stats: &SiteStats) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO site_stats (tag, content_count, user_count, assets_mb, collected_at)
            SELECT tag, $2, $3, $4, $5 FROM tenants WHERE tag = $1
            "#,
        )
        .bind(&stats.tag)
        .bind(stats.content_count)
        .bind(stats.user_count)
        .bind(stats.assets_mb)
        .bind(stats.collected_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn latest_stats(&self) -> Result<HashMap<String, SiteStats>> {
        let rows = sqlx::query_as::<_, SiteStatsRow>(
            r#"
            SELECT DISTINCT ON (tag) tag, content_count, user_count, assets_mb, collected_at
            FROM site_stats
            ORDER BY tag, collected_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| (row.tag.clone(), SiteStats::from(row))).collect())
    }
}
