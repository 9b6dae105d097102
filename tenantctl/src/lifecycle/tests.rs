use chrono::Utc;
use rstest::rstest;
use std::time::Duration;

use super::*;
use crate::db::handlers::TenantRepository;
use crate::errors::Error;
use crate::jobs::{FailedStep, JobKind, JobResult, JobSpec, RestoreSource};
use crate::test_utils::{StaticDnsVerifier, TestHarness, sample_tenant};

fn signup(tag: &str) -> CreateTenant {
    CreateTenant {
        tag: tag.to_string(),
        service_type: ServiceType::Flarum,
        admin_email: "a@x.com".to_string(),
        parent_domain: Some("example.com".to_string()),
        created_ip: Some("10.0.0.1".to_string()),
        force: false,
        send_email: true,
    }
}

fn removal(identifier: &str, skip_backup: bool) -> RemoveTenant {
    RemoveTenant {
        identifier: identifier.to_string(),
        skip_backup,
        reason: "user".to_string(),
        ip: Some("10.0.0.9".to_string()),
        send_email: false,
    }
}

fn failed_with(message: &str) -> JobResult {
    JobResult::failed(
        Some(2),
        vec![FailedStep {
            step: "create site directory".to_string(),
            host: "localhost".to_string(),
            message: message.to_string(),
        }],
    )
}

fn provisioning(tag: &str) -> Tenant {
    let mut tenant = sample_tenant(tag);
    tenant.installed_at = None;
    tenant
}

async fn wait_for_state(h: &TestHarness, tag: &str, state: TenantState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.repo.get(tag).await.unwrap().map(|t| t.state()) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{tag} never reached {state}"));
}

#[test_log::test(tokio::test)]
async fn test_site_lifecycle_end_to_end() {
    let mut h = TestHarness::new();
    let (shutdown, worker) = h.start_worker();

    let scheduled = h.orchestrator.create(signup("forum1")).await.unwrap();
    assert_eq!(scheduled.tenant.state(), TenantState::Provisioning);
    assert_eq!(scheduled.tenant.hostname, "forum1.example.com");
    assert!(scheduled.tenant.installed_at.is_none());

    assert_eq!(scheduled.ticket.wait().await.unwrap(), Some(TenantState::Installed));
    let installed = h.repo.get("forum1").await.unwrap().unwrap();
    assert!(installed.installed_at.is_some());
    assert!(h.routing_map().contains("forum1.example.com forum1;"));

    let removed = h.orchestrator.remove(removal("forum1", false)).await.unwrap();
    assert_eq!(removed.state(), TenantState::Removed);
    assert_eq!(removed.removal_reason.as_deref(), Some("user"));
    assert_eq!(removed.removed_ip.as_deref(), Some("10.0.0.9"));
    assert_eq!(h.jobs.kinds(), vec![JobKind::Provision, JobKind::Backup, JobKind::Remove]);
    assert!(!h.routing_map().contains("forum1"));

    shutdown.cancel();
    worker.await.unwrap();
}

#[rstest]
#[case("abc")]
#[case("Forum_1")]
#[case("a_very_long_tag_of_32_characters")]
#[tokio::test]
async fn test_create_accepts_valid_tags(#[case] tag: &str) {
    let h = TestHarness::new();
    let scheduled = h.orchestrator.create(signup(tag)).await.unwrap();
    assert_eq!(scheduled.tenant.tag, tag);
    assert_eq!(scheduled.tenant.hostname, format!("{}.example.com", tag.to_lowercase()));
}

#[rstest]
#[case("ab")]
#[case("a_tag_that_is_definitely_too_long_")]
#[case("with-dash")]
#[case("with space")]
#[case("www")]
#[case("inttest_x")]
#[tokio::test]
async fn test_create_rejects_invalid_tags(#[case] tag: &str) {
    let h = TestHarness::new();
    let err = h.orchestrator.create(signup(tag)).await.err().unwrap();
    assert!(matches!(err, Error::Validation { .. }), "{tag}: {err:?}");
    assert!(h.repo.list(&TenantFilter::default()).await.unwrap().is_empty());
    assert!(h.jobs.calls().is_empty());
}

#[tokio::test]
async fn test_create_rejects_foreign_parent_domain() {
    let h = TestHarness::new();
    let mut request = signup("forum1");
    request.parent_domain = Some("evil.com".to_string());

    let err = h.orchestrator.create(request).await.err().unwrap();
    assert!(matches!(err, Error::Validation { .. }));
}

#[tokio::test]
async fn test_create_defaults_to_main_domain() {
    let h = TestHarness::new();
    let mut request = signup("Wiki1");
    request.parent_domain = None;

    let scheduled = h.orchestrator.create(request).await.unwrap();
    assert_eq!(scheduled.tenant.hostname, "wiki1.example.com");
}

#[tokio::test]
async fn test_create_conflicts_with_active_tag() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));

    let err = h.orchestrator.create(signup("forum1")).await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_create_names_tag_differing_only_in_case() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));

    let err = h.orchestrator.create(signup("Forum1")).await.err().unwrap();

    let Error::Conflict { message } = err else {
        panic!("expected a conflict, got {err:?}");
    };
    assert!(message.contains("'forum1'"), "{message}");
    assert!(message.contains("forum1.example.com"), "{message}");
    assert!(h.repo.get("Forum1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_reclaims_removed_tag() {
    let h = TestHarness::new();
    let mut old = sample_tenant("forum1");
    old.removed_at = Some(Utc::now());
    old.removal_reason = Some("abandoned".to_string());
    old.donated_amount = rust_decimal::Decimal::new(500, 2);
    h.repo.put(old);

    let scheduled = h.orchestrator.create(signup("forum1")).await.unwrap();

    let fresh = h.repo.get("forum1").await.unwrap().unwrap();
    assert_eq!(fresh.created_at, scheduled.tenant.created_at);
    assert!(fresh.installed_at.is_none());
    assert!(fresh.removed_at.is_none());
    assert!(fresh.removal_reason.is_none());
    assert_eq!(fresh.donated_amount, rust_decimal::Decimal::ZERO);
}

#[tokio::test]
async fn test_finalize_provision_installs_once() {
    let h = TestHarness::new();
    h.repo.put(provisioning("forum1"));

    let outcome = h.orchestrator.finalize_provision("forum1", &JobResult::success()).await.unwrap();
    assert_eq!(outcome, Some(TenantState::Installed));
    let first = h.repo.get("forum1").await.unwrap().unwrap().installed_at;
    assert!(first.is_some());

    let again = h.orchestrator.finalize_provision("forum1", &JobResult::success()).await.unwrap();
    assert_eq!(again, Some(TenantState::Installed));
    assert_eq!(h.repo.get("forum1").await.unwrap().unwrap().installed_at, first);
    assert_eq!(h.proxy.reloads(), 1);
}

#[tokio::test]
async fn test_finalize_provision_for_purged_tenant_is_noop() {
    let h = TestHarness::new();
    let outcome = h.orchestrator.finalize_provision("ghost1", &JobResult::success()).await.unwrap();
    assert_eq!(outcome, None);
}

#[tokio::test]
async fn test_failed_provisioning_is_recorded_and_retried_with_force() {
    let mut h = TestHarness::new();
    let (shutdown, worker) = h.start_worker();
    h.jobs
        .script(JobKind::Provision, Ok(failed_with("Site forum1 already exists")));

    let scheduled = h.orchestrator.create(signup("forum1")).await.unwrap();
    assert_eq!(scheduled.ticket.wait().await.unwrap(), Some(TenantState::Failed));

    let failed = h.repo.get("forum1").await.unwrap().unwrap();
    let failure = failed.failure.clone().unwrap();
    assert_eq!(failure.job, "provision");
    assert_eq!(FailureClass::of(&failure), FailureClass::AlreadyExists);
    assert!(!h.routing_map().contains("forum1"));

    let ticket = h.orchestrator.retry_provision("forum1").await.unwrap();
    assert_eq!(ticket.wait().await.unwrap(), Some(TenantState::Installed));

    let provisions: Vec<bool> = h
        .jobs
        .calls()
        .into_iter()
        .filter_map(|spec| match spec {
            JobSpec::Provision(params) => Some(params.force),
            _ => None,
        })
        .collect();
    assert_eq!(provisions, vec![false, true]);
    assert!(h.repo.get("forum1").await.unwrap().unwrap().failure.is_none());

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_launch_error_marks_failed() {
    let h = TestHarness::new();
    h.repo.put(provisioning("forum1"));
    h.jobs.script(
        JobKind::Provision,
        Err(Error::Internal {
            operation: "launch provision job: No such file or directory".to_string(),
        }),
    );

    let request = ProvisionRequest {
        tag: "forum1".to_string(),
        force: false,
        send_email: false,
    };
    assert_eq!(h.orchestrator.provision(&request).await.unwrap(), Some(TenantState::Failed));

    let failure = h.repo.get("forum1").await.unwrap().unwrap().failure.unwrap();
    assert_eq!(failure.failed_steps[0].step, "launch");
    assert_eq!(FailureClass::of(&failure), FailureClass::Other);
}

#[tokio::test]
async fn test_retry_requires_failed_state() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));

    let err = h.orchestrator.retry_provision("forum1").await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_provisioning_reset_token_is_bound_to_password() {
    let h = TestHarness::new();
    h.repo.put(provisioning("forum1"));

    let request = ProvisionRequest {
        tag: "forum1".to_string(),
        force: false,
        send_email: true,
    };
    h.orchestrator.provision(&request).await.unwrap();

    let Some(JobSpec::Provision(params)) = h.jobs.calls().into_iter().next() else {
        panic!("expected a provisioning job");
    };
    let grant = h.tokens.verify_reset(&params.reset_token).unwrap();
    assert_eq!(grant.tag, "forum1");

    let tenant = h.repo.get("forum1").await.unwrap().unwrap();
    assert!(grant.ensure_matches(&tenant).is_ok());

    let changed = h
        .repo
        .update("forum1", &crate::db::models::tenants::TenantUpdate::password_hash("$argon2id$other"))
        .await
        .unwrap();
    assert!(matches!(
        grant.ensure_matches(&changed),
        Err(Error::TokenInvalid { .. })
    ));
}

#[tokio::test]
async fn test_backup_failure_aborts_removal() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    h.jobs.script(JobKind::Backup, Ok(failed_with("No space left on device")));

    let err = h.orchestrator.remove(removal("forum1", false)).await.err().unwrap();

    assert!(matches!(err, Error::ExternalJob { ref job, .. } if job == "backup"));
    assert_eq!(h.jobs.kinds(), vec![JobKind::Backup]);
    assert_eq!(h.repo.get("forum1").await.unwrap().unwrap().state(), TenantState::Installed);
}

#[tokio::test]
async fn test_failed_removal_job_keeps_site_installed() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    h.jobs.script(JobKind::Remove, Ok(failed_with("permission denied")));

    let err = h.orchestrator.remove(removal("forum1", true)).await.err().unwrap();

    assert!(matches!(err, Error::ExternalJob { .. }));
    assert_eq!(h.jobs.kinds(), vec![JobKind::Remove]);
    assert_eq!(h.repo.get("forum1").await.unwrap().unwrap().state(), TenantState::Installed);
}

#[tokio::test]
async fn test_remove_skips_backup_on_request_and_resolves_identifier() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));

    let removed = h.orchestrator.remove(removal("forum1@x.com", true)).await.unwrap();

    assert_eq!(removed.tag, "forum1");
    assert_eq!(h.jobs.kinds(), vec![JobKind::Remove]);
    let Some(JobSpec::Remove(params)) = h.jobs.calls().into_iter().next() else {
        panic!("expected a removal job");
    };
    assert!(params.skip_backup);
    assert_eq!(params.reason, "user");
}

#[tokio::test]
async fn test_remove_while_provisioning_conflicts() {
    let h = TestHarness::new();
    h.repo.put(provisioning("forum1"));

    let err = h.orchestrator.remove(removal("forum1", true)).await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(h.jobs.calls().is_empty());
}

#[tokio::test]
async fn test_operations_on_locked_tag_fail_fast() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));

    let _busy = h.orchestrator.locks().try_acquire("forum1").await.unwrap();

    let err = h.orchestrator.remove(removal("forum1", true)).await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
    let err = h.orchestrator.upgrade("forum1", false).await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(h.jobs.calls().is_empty());
}

#[tokio::test]
async fn test_overlong_removal_reason_runs_no_jobs() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));

    let err = h
        .orchestrator
        .remove(RemoveTenant {
            reason: "x".repeat(300),
            ..removal("forum1", false)
        })
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::Validation { .. }));
    assert!(h.jobs.calls().is_empty());
    assert_eq!(h.repo.get("forum1").await.unwrap().unwrap().state(), TenantState::Installed);
}

#[tokio::test]
async fn test_remove_failed_site_skips_archive() {
    let h = TestHarness::new();
    let mut tenant = provisioning("forum1");
    tenant.failed_at = Some(Utc::now());
    tenant.failure = Some(failed_with("boom").failure(JobKind::Provision));
    h.repo.put(tenant);

    let removed = h.orchestrator.remove(removal("forum1", false)).await.unwrap();

    assert_eq!(removed.state(), TenantState::Removed);
    assert_eq!(h.jobs.kinds(), vec![JobKind::Remove]);
}

#[tokio::test]
async fn test_invalid_rewrite_leaves_hostname_untouched() {
    let h = TestHarness::new();
    let mut tenant = sample_tenant("forum1");
    tenant.hostname = "legacy host".to_string();
    h.repo.put(tenant);

    let err = h.orchestrator.unlink_custom_domain("forum1", "example.com").await.err().unwrap();

    assert!(matches!(err, Error::Validation { .. }));
    assert!(h.jobs.calls().is_empty());
    assert_eq!(h.repo.get("forum1").await.unwrap().unwrap().hostname, "legacy host");
}

#[tokio::test]
async fn test_remove_unknown_site() {
    let h = TestHarness::new();
    let err = h.orchestrator.remove(removal("nobody", true)).await.err().unwrap();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_change_hostname_to_other_platform_domain() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));

    let change = h.orchestrator.change_hostname("forum1", "Forum1.Example.ORG").await.unwrap();

    assert_eq!(change.old_hostname, "forum1.example.com");
    assert_eq!(change.tenant.hostname, "forum1.example.org");
    assert!(change.rewrite_error.is_none());
    assert!(h.routing_map().contains("forum1.example.org forum1;"));
    assert!(!h.routing_map().contains("forum1.example.com"));

    let Some(JobSpec::RewriteUrls(params)) = h.jobs.calls().into_iter().next() else {
        panic!("expected a URL rewrite job");
    };
    assert_eq!(params.old_hostname, "forum1.example.com");
    assert_eq!(params.new_hostname, "forum1.example.org");
}

#[tokio::test]
async fn test_change_hostname_keeps_change_when_rewrite_fails() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    h.jobs.script(JobKind::RewriteUrls, Ok(failed_with("database locked")));

    let change = h.orchestrator.change_hostname("forum1", "forum1.example.org").await.unwrap();

    assert!(change.rewrite_error.unwrap().contains("database locked"));
    assert_eq!(h.repo.get("forum1").await.unwrap().unwrap().hostname, "forum1.example.org");
}

#[tokio::test]
async fn test_change_hostname_rejects_other_tags_default_form() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));

    let err = h.orchestrator.change_hostname("forum1", "forum2.example.com").await.err().unwrap();
    assert!(matches!(err, Error::Validation { .. }));

    let err = h.orchestrator.change_hostname("forum1", "forum1.example.com").await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(h.jobs.calls().is_empty());
}

#[tokio::test]
async fn test_link_and_unlink_custom_domain() {
    let h = TestHarness::with_dns(StaticDnsVerifier::pointing(&["www.mysite.org"]));
    let mut tenant = sample_tenant("forum1");
    tenant.donated_amount = rust_decimal::Decimal::new(750, 2);
    h.repo.put(tenant);

    let linked = h.orchestrator.link_custom_domain("forum1", "www.mysite.org").await.unwrap();
    assert_eq!(linked.tenant.hostname, "www.mysite.org");
    assert!(h.routing_map().contains("www.mysite.org forum1;"));

    let unlinked = h.orchestrator.unlink_custom_domain("forum1", "example.org").await.unwrap();
    assert_eq!(unlinked.old_hostname, "www.mysite.org");
    assert_eq!(unlinked.tenant.hostname, "forum1.example.org");

    let err = h.orchestrator.unlink_custom_domain("forum1", "example.org").await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
    assert_eq!(h.jobs.count(JobKind::RewriteUrls), 2);
}

#[tokio::test]
async fn test_link_custom_domain_without_perks() {
    let h = TestHarness::with_dns(StaticDnsVerifier::pointing(&["www.mysite.org"]));
    h.repo.put(sample_tenant("forum1"));

    let err = h.orchestrator.link_custom_domain("forum1", "www.mysite.org").await.err().unwrap();
    assert!(matches!(err, Error::Authorization { .. }));
    assert_eq!(h.repo.get("forum1").await.unwrap().unwrap().hostname, "forum1.example.com");
}

#[tokio::test]
async fn test_upgrade_requires_installed_site() {
    let h = TestHarness::new();
    h.repo.put(provisioning("forum1"));

    let err = h.orchestrator.upgrade("forum1", false).await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_upgrade_all_continues_past_failures() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    h.repo.put(sample_tenant("forum2"));
    h.repo.put(provisioning("forum3"));
    let mut wiki = sample_tenant("wiki1");
    wiki.service_type = ServiceType::Mediawiki;
    h.repo.put(wiki);
    h.jobs.script(JobKind::Upgrade, Ok(failed_with("migration failed")));

    let filter = TenantFilter::active().with_service_type(Some(ServiceType::Flarum));
    let report = h.orchestrator.upgrade_all(&filter, true).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "forum1");
    assert_eq!(report.succeeded, vec!["forum2".to_string()]);
    assert!(!report.is_success());
    assert_eq!(h.jobs.count(JobKind::Upgrade), 2);
}

#[tokio::test]
async fn test_restore_from_periodic_backup() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

    h.orchestrator.restore("forum1", RestoreSource::Periodic { date }).await.unwrap();

    let Some(JobSpec::Restore(params)) = h.jobs.calls().into_iter().next() else {
        panic!("expected a restore job");
    };
    assert_eq!(params.source, RestoreSource::Periodic { date });
    assert_eq!(h.repo.get("forum1").await.unwrap().unwrap().state(), TenantState::Installed);
}

#[tokio::test]
async fn test_backup_all_covers_installed_sites() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    h.repo.put(provisioning("forum2"));

    let report = h.orchestrator.backup_all(BackupMode::Periodic, 14).await.unwrap();

    assert_eq!(report.succeeded, vec!["forum1".to_string()]);
    let Some(JobSpec::Backup(params)) = h.jobs.calls().into_iter().next() else {
        panic!("expected a backup job");
    };
    assert_eq!(params.mode, BackupMode::Periodic);
    assert_eq!(params.delete_older_than_days, 14);
}

#[tokio::test]
async fn test_reconcile_resubmits_stale_provisioning() {
    let mut h = TestHarness::new();
    let mut stale = provisioning("forum1");
    stale.updated_at = Utc::now() - chrono::Duration::hours(2);
    h.repo.put(stale);
    h.repo.put(provisioning("fresh1"));

    let tickets = h.orchestrator.reconcile_once(Duration::from_secs(45 * 60)).await.unwrap();
    let tags: Vec<&str> = tickets.iter().map(JobTicket::tag).collect();
    assert_eq!(tags, vec!["forum1"]);

    let (shutdown, worker) = h.start_worker();
    for ticket in tickets {
        assert_eq!(ticket.wait().await.unwrap(), Some(TenantState::Installed));
    }
    wait_for_state(&h, "forum1", TenantState::Installed).await;
    assert_eq!(h.repo.get("fresh1").await.unwrap().unwrap().state(), TenantState::Provisioning);

    let Some(JobSpec::Provision(params)) = h.jobs.calls().into_iter().next() else {
        panic!("expected a provisioning job");
    };
    assert!(params.force);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_worker_rejects_duplicate_in_flight_provisioning() {
    let mut h = TestHarness::new();
    h.repo.put(provisioning("forum1"));
    let gate = h.jobs.hold(JobKind::Provision);
    let (shutdown, worker) = h.start_worker();

    let request = ProvisionRequest {
        tag: "forum1".to_string(),
        force: false,
        send_email: false,
    };
    let first = h.orchestrator.schedule_provision(request.clone()).unwrap();
    let second = h.orchestrator.schedule_provision(request).unwrap();

    let err = second.wait().await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));

    gate.notify_one();
    assert_eq!(first.wait().await.unwrap(), Some(TenantState::Installed));
    assert_eq!(h.jobs.count(JobKind::Provision), 1);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_worker_skips_sites_no_longer_provisioning() {
    let mut h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    let (shutdown, worker) = h.start_worker();

    let ticket = h
        .orchestrator
        .schedule_provision(ProvisionRequest {
            tag: "forum1".to_string(),
            force: true,
            send_email: false,
        })
        .unwrap();

    assert_eq!(ticket.wait().await.unwrap(), Some(TenantState::Installed));
    assert!(h.jobs.calls().is_empty());

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_sync_routes_rebuilds_from_repository() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    h.repo.put(sample_tenant("forum2"));
    let mut gone = sample_tenant("gone1");
    gone.removed_at = Some(Utc::now());
    h.repo.put(gone);

    assert_eq!(h.orchestrator.sync_routes().await.unwrap(), 2);

    h.repo
        .update("forum2", &crate::db::models::tenants::TenantUpdate::hostname("forum2.example.org"))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.sync_routes().await.unwrap(), 2);

    let map = h.routing_map();
    assert_eq!(map.lines().filter(|l| !l.starts_with('#')).count(), 2);
    assert!(map.contains("forum2.example.org forum2;"));
    assert!(!map.contains("forum2.example.com"));
    assert!(!map.contains("gone1"));
}

fn reporting(content: i64, users: i64, assets_mb: f64) -> JobResult {
    let mut result = JobResult::success();
    result.stdout = format!(
        r#"{{"event": "runner_on_ok", "event_data": {{"task": "report", "host": "localhost", "res": {{"tenant_stats": {{"content_count": {content}, "user_count": {users}, "assets_mb": {assets_mb}}}}}}}}}"#
    );
    result
}

fn aged(tag: &str) -> Tenant {
    let mut tenant = sample_tenant(tag);
    tenant.created_at = Utc::now() - chrono::Duration::days(90);
    tenant
}

async fn seed_stats(h: &TestHarness, tenant: Tenant, content_count: i64, user_count: i64, assets_mb: f64) {
    let tag = tenant.tag.clone();
    h.repo.put(tenant);
    h.repo
        .record_stats(&SiteStats {
            tag,
            content_count,
            user_count,
            assets_mb,
            collected_at: Utc::now(),
        })
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_collect_stats_records_reported_numbers() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    h.repo.put(sample_tenant("forum2"));
    h.repo.put(provisioning("forum3"));
    h.jobs.script(JobKind::CollectStats, Ok(reporting(42, 3, 12.5)));
    // Succeeds without reporting anything
    h.jobs.script(JobKind::CollectStats, Ok(JobResult::success()));

    let report = h.orchestrator.collect_stats().await.unwrap();

    assert_eq!(report.succeeded, vec!["forum1".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "forum2");
    assert!(matches!(report.failed[0].1, Error::ExternalJob { .. }));
    assert_eq!(h.jobs.count(JobKind::CollectStats), 2);

    let latest = h.repo.latest_stats().await.unwrap();
    assert_eq!(latest.len(), 1);
    let stats = &latest["forum1"];
    assert_eq!((stats.content_count, stats.user_count, stats.assets_mb), (42, 3, 12.5));
}

#[tokio::test]
async fn test_collect_stats_skips_busy_sites() {
    let h = TestHarness::new();
    h.repo.put(sample_tenant("forum1"));
    let _held = h.orchestrator.locks().try_acquire("forum1").await.unwrap();

    let report = h.orchestrator.collect_stats().await.unwrap();

    assert!(matches!(report.failed[0].1, Error::Conflict { .. }));
    assert!(h.jobs.calls().is_empty());
}

#[tokio::test]
async fn test_cleanup_requires_collected_stats() {
    let h = TestHarness::new();
    h.repo.put(aged("forum1"));

    let err = h.orchestrator.cleanup(true, false).await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(h.jobs.calls().is_empty());
}

#[tokio::test]
async fn test_cleanup_dry_run_only_flags() {
    let h = TestHarness::new();
    seed_stats(&h, aged("idle1"), 3, 1, 0.0).await;
    seed_stats(&h, aged("busy1"), 20_000, 40, 10.0).await;
    seed_stats(&h, aged("healthy1"), 500, 50, 10.0).await;
    seed_stats(&h, sample_tenant("young1"), 0, 1, 0.0).await;
    let mut donor = aged("donor1");
    donor.donated_amount = rust_decimal::Decimal::new(750, 2);
    seed_stats(&h, donor, 0, 1, 0.0).await;
    h.repo.put(aged("nostats1"));

    let report = h.orchestrator.cleanup(true, false).await.unwrap();

    let mut flagged: Vec<_> = report.flagged.iter().map(|f| f.tenant.tag.as_str()).collect();
    flagged.sort_unstable();
    assert_eq!(flagged, vec!["busy1", "idle1"]);
    assert!(report.removed.succeeded.is_empty());
    assert!(h.jobs.calls().is_empty());
    assert!(h.repo.get("idle1").await.unwrap().unwrap().is_installed());
}

#[test_log::test(tokio::test)]
async fn test_cleanup_removes_flagged_sites() {
    let h = TestHarness::new();
    seed_stats(&h, aged("idle1"), 3, 1, 0.0).await;
    seed_stats(&h, aged("healthy1"), 500, 50, 10.0).await;
    h.orchestrator.sync_routes().await.unwrap();

    let report = h.orchestrator.cleanup(false, false).await.unwrap();

    assert_eq!(report.removed.succeeded, vec!["idle1".to_string()]);
    assert!(report.removed.is_success());
    let removed = h.repo.get("idle1").await.unwrap().unwrap();
    assert_eq!(removed.state(), TenantState::Removed);
    assert_eq!(removed.removal_reason.as_deref(), Some("auto-cleanup: inactive (content=3, users=1)"));
    assert_eq!(h.jobs.kinds(), vec![JobKind::Backup, JobKind::Remove]);
    assert!(!h.routing_map().contains("idle1"));
    assert!(h.routing_map().contains("healthy1.example.com"));
}

#[tokio::test]
async fn test_backup_system_retention() {
    let h = TestHarness::new();

    h.orchestrator.backup_system(Some(7)).await.unwrap();
    h.orchestrator.backup_system(None).await.unwrap();

    let retention: Vec<_> = h
        .jobs
        .calls()
        .into_iter()
        .map(|spec| match spec {
            JobSpec::BackupSystem(params) => params.delete_older_than_days,
            other => panic!("unexpected job {:?}", other.kind()),
        })
        .collect();
    assert_eq!(retention, vec![Some(7), None]);
}

#[tokio::test]
async fn test_backup_system_runs_one_at_a_time() {
    let h = TestHarness::new();
    let _held = h.orchestrator.locks().try_acquire(":system").await.unwrap();

    let err = h.orchestrator.backup_system(Some(7)).await.err().unwrap();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(h.jobs.calls().is_empty());
}
