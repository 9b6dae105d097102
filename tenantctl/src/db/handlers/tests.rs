use chrono::{Duration, Utc};
use rstest::{fixture, rstest};
use rust_decimal::Decimal;

use super::repository::{DONATION_CONSTRAINT, HOSTNAME_CONSTRAINT, TAG_CONSTRAINT};
use super::{InMemoryTenants, TenantRepository};
use crate::db::errors::DbError;
use crate::db::models::stats::SiteStats;
use crate::db::models::tenants::{NewTenant, StatusFilter, TenantFilter, TenantState, TenantUpdate};
use crate::jobs::{FailedStep, JobFailure};
use crate::types::ServiceType;

#[cfg(feature = "postgres-tests")]
use super::PostgresTenants;

fn new_tenant(tag: &str) -> NewTenant {
    NewTenant {
        tag: tag.to_string(),
        service_type: ServiceType::Flarum,
        hostname: format!("{}.example.com", tag.to_lowercase()),
        admin_email: format!("{tag}@x.com"),
        admin_password_hash: "$argon2id$v=19$hash".to_string(),
        created_ip: Some("10.0.0.1".to_string()),
    }
}

fn failure() -> JobFailure {
    JobFailure {
        job: "provision".to_string(),
        exit_code: Some(2),
        failed_steps: vec![FailedStep {
            step: "create database".to_string(),
            host: "localhost".to_string(),
            message: "disk full".to_string(),
        }],
    }
}

#[fixture]
fn in_memory() -> InMemoryTenants {
    InMemoryTenants::new()
}

/// Generates an in-memory test and, with `postgres-tests`, a `#[sqlx::test]` twin.
macro_rules! repository_test {
    ($name:ident, $pg_name:ident, $body:ident) => {
        #[rstest]
        #[tokio::test]
        async fn $name(in_memory: InMemoryTenants) {
            $body(&in_memory).await;
        }

        #[cfg(feature = "postgres-tests")]
        #[sqlx::test]
        async fn $pg_name(pool: sqlx::PgPool) {
            $body(&PostgresTenants::new(pool)).await;
        }
    };
}

async fn run_insert_starts_provisioning<R: TenantRepository>(repo: &R) {
    let tenant = repo.insert(&new_tenant("forum1")).await.unwrap();

    assert_eq!(tenant.state(), TenantState::Provisioning);
    assert_eq!(tenant.hostname, "forum1.example.com");
    assert_eq!(tenant.donated_amount, Decimal::ZERO);
    assert_eq!(repo.get("forum1").await.unwrap().unwrap().tag, "forum1");
}
repository_test!(test_insert_starts_provisioning, test_insert_starts_provisioning_postgres, run_insert_starts_provisioning);

async fn run_insert_rejects_active_tag<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();

    let mut dup = new_tenant("forum1");
    dup.hostname = "other.example.com".to_string();
    let err = repo.insert(&dup).await.unwrap_err();
    assert!(err.is_unique_violation_on(TAG_CONSTRAINT), "{err:?}");
}
repository_test!(test_insert_rejects_active_tag, test_insert_rejects_active_tag_postgres, run_insert_rejects_active_tag);

async fn run_insert_rejects_active_hostname<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();

    let mut other = new_tenant("forum2");
    other.hostname = "forum1.example.com".to_string();
    let err = repo.insert(&other).await.unwrap_err();
    assert!(err.is_unique_violation_on(HOSTNAME_CONSTRAINT), "{err:?}");
}
repository_test!(
    test_insert_rejects_active_hostname,
    test_insert_rejects_active_hostname_postgres,
    run_insert_rejects_active_hostname
);

async fn run_insert_reclaims_removed_tag<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    repo.mark_installed("forum1", Utc::now()).await.unwrap();
    assert!(repo.mark_removed("forum1", "user", None, Utc::now()).await.unwrap());

    let reborn = repo.insert(&new_tenant("forum1")).await.unwrap();
    assert_eq!(reborn.state(), TenantState::Provisioning);
    assert!(reborn.installed_at.is_none());
    assert!(reborn.removal_reason.is_none());

    let all = repo
        .list(&TenantFilter {
            status: StatusFilter::All,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}
repository_test!(test_insert_reclaims_removed_tag, test_insert_reclaims_removed_tag_postgres, run_insert_reclaims_removed_tag);

async fn run_mark_installed_only_once<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    let first = Utc::now();

    assert!(repo.mark_installed("forum1", first).await.unwrap());
    let installed_at = repo.get("forum1").await.unwrap().unwrap().installed_at;

    assert!(!repo.mark_installed("forum1", first + Duration::hours(1)).await.unwrap());
    assert_eq!(repo.get("forum1").await.unwrap().unwrap().installed_at, installed_at);
}
repository_test!(test_mark_installed_only_once, test_mark_installed_only_once_postgres, run_mark_installed_only_once);

async fn run_failure_round_trip<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();

    assert!(repo.mark_failed("forum1", &failure(), Utc::now()).await.unwrap());
    assert!(!repo.mark_failed("forum1", &failure(), Utc::now()).await.unwrap());

    let failed = repo.get("forum1").await.unwrap().unwrap();
    assert_eq!(failed.state(), TenantState::Failed);
    assert_eq!(failed.failure, Some(failure()));

    assert!(repo.clear_failure("forum1").await.unwrap());
    assert!(!repo.clear_failure("forum1").await.unwrap());
    assert_eq!(repo.get("forum1").await.unwrap().unwrap().state(), TenantState::Provisioning);
}
repository_test!(test_failure_round_trip, test_failure_round_trip_postgres, run_failure_round_trip);

async fn run_mark_removed_is_terminal<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    repo.mark_installed("forum1", Utc::now()).await.unwrap();

    assert!(repo.mark_removed("forum1", "user", Some("10.0.0.9"), Utc::now()).await.unwrap());
    let removed_at = repo.get("forum1").await.unwrap().unwrap().removed_at;
    assert!(!repo.mark_removed("forum1", "again", None, Utc::now()).await.unwrap());

    let tenant = repo.get("forum1").await.unwrap().unwrap();
    assert_eq!(tenant.state(), TenantState::Removed);
    assert_eq!(tenant.removed_at, removed_at);
    assert_eq!(tenant.removal_reason.as_deref(), Some("user"));
    assert_eq!(tenant.removed_ip.as_deref(), Some("10.0.0.9"));

    assert!(repo.list_active().await.unwrap().is_empty());
    assert!(matches!(
        repo.update("forum1", &TenantUpdate::hostname("x.example.com")).await,
        Err(DbError::NotFound)
    ));
}
repository_test!(test_mark_removed_is_terminal, test_mark_removed_is_terminal_postgres, run_mark_removed_is_terminal);

async fn run_removed_hostname_is_reusable<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    repo.mark_removed("forum1", "user", None, Utc::now()).await.unwrap();

    let mut other = new_tenant("forum2");
    other.hostname = "forum1.example.com".to_string();
    assert!(repo.insert(&other).await.is_ok());
}
repository_test!(
    test_removed_hostname_is_reusable,
    test_removed_hostname_is_reusable_postgres,
    run_removed_hostname_is_reusable
);

async fn run_get_by_identifier<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    repo.insert(&new_tenant("wiki22")).await.unwrap();

    let by_tag = repo.get_by_identifier("forum1", false).await.unwrap().unwrap();
    assert_eq!(by_tag.tag, "forum1");
    let by_host = repo.get_by_identifier("WIKI22.example.com", false).await.unwrap().unwrap();
    assert_eq!(by_host.tag, "wiki22");
    let by_email = repo.get_by_identifier("Forum1@X.com", false).await.unwrap().unwrap();
    assert_eq!(by_email.tag, "forum1");
    assert!(repo.get_by_identifier("nobody", false).await.unwrap().is_none());

    repo.mark_removed("wiki22", "user", None, Utc::now()).await.unwrap();
    assert!(repo.get_by_identifier("wiki22", false).await.unwrap().is_none());
    assert!(repo.get_by_identifier("wiki22", true).await.unwrap().unwrap().is_removed());
}
repository_test!(test_get_by_identifier, test_get_by_identifier_postgres, run_get_by_identifier);

async fn run_update_partial<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    repo.insert(&new_tenant("forum2")).await.unwrap();

    let updated = repo
        .update("forum1", &TenantUpdate::login(Utc::now(), Some("10.1.1.1".to_string())))
        .await
        .unwrap();
    assert_eq!(updated.last_login_ip.as_deref(), Some("10.1.1.1"));
    assert_eq!(updated.hostname, "forum1.example.com");

    let err = repo
        .update("forum1", &TenantUpdate::hostname("forum2.example.com"))
        .await
        .unwrap_err();
    assert!(err.is_unique_violation_on(HOSTNAME_CONSTRAINT));

    let updated = repo.update("forum1", &TenantUpdate::hostname("www.mysite.org")).await.unwrap();
    assert_eq!(updated.hostname, "www.mysite.org");
}
repository_test!(test_update_partial, test_update_partial_postgres, run_update_partial);

async fn run_donations_accumulate<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();

    assert_eq!(repo.add_donation("forum1", Decimal::new(350, 2)).await.unwrap(), Decimal::new(350, 2));
    assert_eq!(repo.add_donation("forum1", Decimal::new(400, 2)).await.unwrap(), Decimal::new(750, 2));

    let err = repo.add_donation("forum1", Decimal::new(-100, 2)).await.unwrap_err();
    assert!(matches!(err, DbError::CheckViolation { constraint: Some(c), .. } if c == DONATION_CONSTRAINT));
    assert!(matches!(repo.add_donation("ghost1", Decimal::ONE).await, Err(DbError::NotFound)));
}
repository_test!(test_donations_accumulate, test_donations_accumulate_postgres, run_donations_accumulate);

async fn run_list_filters<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("alpha")).await.unwrap();
    let mut wiki = new_tenant("bravo");
    wiki.service_type = ServiceType::Mediawiki;
    wiki.created_ip = Some("10.9.9.9".to_string());
    repo.insert(&wiki).await.unwrap();
    repo.insert(&new_tenant("charlie")).await.unwrap();
    repo.mark_installed("alpha", Utc::now()).await.unwrap();
    repo.add_donation("charlie", Decimal::ONE).await.unwrap();

    let tags = |tenants: Vec<crate::db::models::tenants::Tenant>| tenants.into_iter().map(|t| t.tag).collect::<Vec<_>>();

    assert_eq!(tags(repo.list_active().await.unwrap()), vec!["alpha", "bravo", "charlie"]);
    let wikis = TenantFilter::active().with_service_type(Some(ServiceType::Mediawiki));
    assert_eq!(tags(repo.list(&wikis).await.unwrap()), vec!["bravo"]);

    let donors = TenantFilter {
        donors_only: true,
        ..Default::default()
    };
    assert_eq!(tags(repo.list(&donors).await.unwrap()), vec!["charlie"]);

    let not_installed = TenantFilter {
        not_installed: true,
        ..Default::default()
    };
    assert_eq!(tags(repo.list(&not_installed).await.unwrap()), vec!["bravo", "charlie"]);

    let by_ip = TenantFilter {
        ip: Some("10.9.9.9".to_string()),
        ..Default::default()
    };
    assert_eq!(tags(repo.list(&by_ip).await.unwrap()), vec!["bravo"]);

    let by_email = TenantFilter {
        email_contains: Some("CHAR".to_string()),
        ..Default::default()
    };
    assert_eq!(tags(repo.list(&by_email).await.unwrap()), vec!["charlie"]);

    let page = TenantFilter {
        skip: 1,
        limit: Some(1),
        ..Default::default()
    };
    assert_eq!(tags(repo.list(&page).await.unwrap()), vec!["bravo"]);
}
repository_test!(test_list_filters, test_list_filters_postgres, run_list_filters);

async fn run_list_stale_provisioning<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("stuck1")).await.unwrap();
    repo.insert(&new_tenant("done1")).await.unwrap();
    repo.insert(&new_tenant("failed1")).await.unwrap();
    repo.mark_installed("done1", Utc::now()).await.unwrap();
    repo.mark_failed("failed1", &failure(), Utc::now()).await.unwrap();

    let future = Utc::now() + Duration::minutes(1);
    let stale = repo.list_stale_provisioning(future).await.unwrap();
    assert_eq!(stale.iter().map(|t| t.tag.as_str()).collect::<Vec<_>>(), vec!["stuck1"]);

    let past = Utc::now() - Duration::hours(1);
    assert!(repo.list_stale_provisioning(past).await.unwrap().is_empty());
}
repository_test!(test_list_stale_provisioning, test_list_stale_provisioning_postgres, run_list_stale_provisioning);

async fn run_delete_purges<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    assert!(repo.delete("forum1").await.unwrap());
    assert!(!repo.delete("forum1").await.unwrap());
    assert!(repo.get("forum1").await.unwrap().is_none());
}
repository_test!(test_delete_purges, test_delete_purges_postgres, run_delete_purges);

fn snapshot(tag: &str, content_count: i64, collected_at: chrono::DateTime<Utc>) -> SiteStats {
    SiteStats {
        tag: tag.to_string(),
        content_count,
        user_count: 3,
        assets_mb: 1.5,
        collected_at,
    }
}

async fn run_latest_stats_per_tenant<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    repo.insert(&new_tenant("wiki22")).await.unwrap();
    assert!(repo.latest_stats().await.unwrap().is_empty());

    let earlier = Utc::now() - Duration::days(1);
    repo.record_stats(&snapshot("forum1", 5, earlier)).await.unwrap();
    repo.record_stats(&snapshot("forum1", 40, Utc::now())).await.unwrap();
    repo.record_stats(&snapshot("wiki22", 7, earlier)).await.unwrap();

    let latest = repo.latest_stats().await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest["forum1"].content_count, 40);
    assert_eq!(latest["wiki22"].content_count, 7);

    let err = repo.record_stats(&snapshot("nobody", 1, Utc::now())).await.unwrap_err();
    assert!(matches!(err, DbError::NotFound));
}
repository_test!(test_latest_stats_per_tenant, test_latest_stats_per_tenant_postgres, run_latest_stats_per_tenant);

async fn run_reclaiming_a_tag_drops_its_stats<R: TenantRepository>(repo: &R) {
    repo.insert(&new_tenant("forum1")).await.unwrap();
    repo.record_stats(&snapshot("forum1", 5, Utc::now())).await.unwrap();
    repo.mark_removed("forum1", "user", None, Utc::now()).await.unwrap();

    repo.insert(&new_tenant("forum1")).await.unwrap();
    assert!(repo.latest_stats().await.unwrap().is_empty());
}
repository_test!(
    test_reclaiming_a_tag_drops_its_stats,
    test_reclaiming_a_tag_drops_its_stats_postgres,
    run_reclaiming_a_tag_drops_its_stats
);
