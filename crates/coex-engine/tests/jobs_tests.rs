mod common;

use chrono::Duration;
use coex_core::{
    AlertAction, AlertSeverity, AuditAction, CoexError, CollaboratorError, CommunityId,
    HealthStatus, MemberId, MigrationMode, MigrationStrategy,
};
use coex_engine::health::HealthMonitor;
use coex_engine::migration::MigrationEngine;
use coex_engine::profiler::IncumbentProfiler;
use coex_engine::watcher::RollbackWatcher;
use coex_engine::{EngineContext, JobKind, JobReport, JobRunner};
use coex_store::{InMemoryStore, MigrationStore};
use coex_test_utils::{
    collabland_platform, community, t0, test_config, FailingStore, FakeEligibility,
    FakeIdentities, ManualClock, RecordingAlerts, COLLABLAND_BOT,
};
use common::{member_name, Harness};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;

#[tokio::test]
async fn transient_failures_are_retried_then_reported() {
    let h = Harness::aligned(3);
    h.detect().await;
    h.platform.set_unavailable(true);

    let failure = JobRunner::new(h.ctx.clone())
        .run(&h.community, JobKind::HealthCheck)
        .await
        .unwrap_err();
    assert_eq!(failure.kind, JobKind::HealthCheck);
    assert_eq!(failure.attempts, 3);
    assert!(matches!(
        failure.source,
        CoexError::Collaborator(CollaboratorError::Unavailable { .. })
    ));
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let h = Harness::aligned(1);
    let failure = JobRunner::new(h.ctx.clone())
        .run(&CommunityId::from("unknown"), JobKind::ShadowSync)
        .await
        .unwrap_err();
    assert_eq!(failure.attempts, 1);
    assert!(matches!(failure.source, CoexError::NotManaged(_)));
}

#[tokio::test(start_paused = true)]
async fn hung_job_hits_the_wall_clock_timeout() {
    let mut config = test_config();
    config.jobs.timeout_secs = 1;
    config.shadow.member_timeout_secs = 30;
    let c = community();
    let platform = collabland_platform(&c, t0()).with_member(&c, "slow", &["Holder"]);
    let h = Harness::with_config(platform, config);
    h.link("slow", Some("Holder"));
    h.detect().await;
    h.platform
        .slow_member(&MemberId::from("slow"), std::time::Duration::from_secs(60));

    let failure = JobRunner::new(h.ctx.clone())
        .run(&c, JobKind::ShadowSync)
        .await
        .unwrap_err();
    assert!(matches!(failure.source, CoexError::Timeout { duration_secs: 1 }));
    assert_eq!(failure.attempts, 3);
    assert!(h.state().await.last_shadow_sync_at.is_none());
}

#[tokio::test]
async fn jobs_outside_their_mode_are_skipped() {
    let h = Harness::aligned(2);
    h.detect().await;
    let runner = JobRunner::new(h.ctx.clone());

    let report = runner.run(&h.community, JobKind::ParallelSync).await.unwrap();
    assert_eq!(report, JobReport::Skipped { mode: MigrationMode::Shadow });
    assert_eq!(h.platform.mutation_count(), 0);
}

#[tokio::test]
async fn run_due_follows_the_schedule() {
    let h = Harness::aligned(2);
    h.detect().await;
    let runner = JobRunner::new(h.ctx.clone());

    let results = runner.run_due(&h.community, &BTreeMap::new()).await.unwrap();
    let kinds: Vec<_> = results.iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![JobKind::ShadowSync, JobKind::HealthCheck]);
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    let mut last_runs = BTreeMap::new();
    last_runs.insert(JobKind::ShadowSync, h.now());
    last_runs.insert(JobKind::HealthCheck, h.now());
    h.advance(Duration::hours(1));
    let results = runner.run_due(&h.community, &last_runs).await.unwrap();
    let kinds: Vec<_> = results.iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![JobKind::HealthCheck]);
}

#[tokio::test]
async fn degraded_incumbent_alerts_once_per_window() {
    let h = Harness::aligned(2);
    h.detect().await;
    let monitor = HealthMonitor::new(h.ctx.clone());

    let healthy = monitor.check(&h.community).await.unwrap();
    assert_eq!(healthy.status, HealthStatus::Healthy);
    assert_eq!(h.alerts.count(), 0);

    h.platform
        .set_automation_online(&h.community, COLLABLAND_BOT, false);
    let first = monitor.check(&h.community).await.unwrap();
    assert_eq!(first.status, HealthStatus::Critical);
    assert!(first.alerted);

    h.clock.advance(Duration::hours(1));
    let second = monitor.check(&h.community).await.unwrap();
    assert_eq!(second.status, HealthStatus::Critical);
    assert!(!second.alerted);
    assert_eq!(h.alerts.count(), 1);

    h.clock.advance(Duration::hours(4));
    assert!(monitor.check(&h.community).await.unwrap().alerted);
    assert_eq!(h.alerts.count(), 2);

    let alert = &h.alerts.sent()[0];
    assert_eq!(alert.severity, AlertSeverity::Critical);
    assert_eq!(alert.actions, vec![AlertAction::ActivateBackup, AlertAction::Acknowledge]);

    let profile = h.store.load_profile(&h.community).await.unwrap().unwrap();
    assert_eq!(profile.health_status, HealthStatus::Critical);
    // Advisory only.
    assert_eq!(h.state().await.mode(), MigrationMode::Shadow);
}

#[tokio::test]
async fn stale_grant_activity_escalates_with_age() {
    let h = Harness::aligned(1);
    h.detect().await;
    let monitor = HealthMonitor::new(h.ctx.clone());

    h.clock.advance(Duration::hours(50));
    let warning = monitor.check(&h.community).await.unwrap();
    assert_eq!(warning.status, HealthStatus::Warning);

    h.clock.advance(Duration::hours(24));
    let critical = monitor.check(&h.community).await.unwrap();
    assert_eq!(critical.status, HealthStatus::Critical);
}

#[tokio::test]
async fn undelivered_alert_is_retried_next_check() {
    let h = Harness::aligned(1);
    h.detect().await;
    let monitor = HealthMonitor::new(h.ctx.clone());
    h.platform.remove_automation(&h.community, COLLABLAND_BOT);
    h.alerts.set_failing(true);

    assert!(!monitor.check(&h.community).await.unwrap().alerted);
    h.alerts.set_failing(false);
    h.clock.advance(Duration::minutes(30));
    assert!(monitor.check(&h.community).await.unwrap().alerted);
}

#[tokio::test]
async fn failed_automatic_rollback_escalates() {
    let c = community();
    let mut platform = collabland_platform(&c, t0());
    for i in 0..10 {
        platform = platform.with_member(&c, &member_name(i), &["Holder"]);
    }
    let platform = Arc::new(platform);
    let store = Arc::new(FailingStore::new(InMemoryStore::new()));
    let eligibility = Arc::new(FakeEligibility::new());
    let identities = Arc::new(FakeIdentities::new());
    let alerts = Arc::new(RecordingAlerts::new());
    let clock = Arc::new(ManualClock::new(t0()));
    for i in 0..10 {
        let wallet = format!("wallet-{i}");
        identities.link(&member_name(i), &wallet);
        eligibility.set(&wallet, coex_core::EligibilityResult::eligible("Holder", 1.0));
    }
    let ctx = EngineContext::new(
        store.clone(),
        platform.clone(),
        eligibility.clone(),
        identities,
        alerts.clone(),
    )
    .with_clock(clock.clone())
    .with_config(test_config());

    IncumbentProfiler::new(ctx.clone()).unwrap().detect(&c).await.unwrap();
    MigrationEngine::new(ctx.clone())
        .emergency_backup(&c, "op", true)
        .await
        .unwrap();
    assert_eq!(ctx.store().load_state(&c).await.unwrap().unwrap().strategy, Some(MigrationStrategy::Instant));

    clock.advance(Duration::minutes(5));
    for i in 0..3 {
        eligibility.set(&format!("wallet-{i}"), coex_core::EligibilityResult::ineligible(0.0));
    }
    coex_engine::grants::NamespacedGrantManager::new(ctx.clone())
        .sync(&c)
        .await
        .unwrap();

    store.fail_state_writes(true);
    let err = RollbackWatcher::new(ctx.clone()).evaluate(&c).await.unwrap_err();
    assert!(matches!(err, CoexError::Store(_)));

    let state = store.inner().load_state(&c).await.unwrap().unwrap();
    assert_eq!(state.mode(), MigrationMode::Parallel);
    assert_eq!(state.rollback_count, 0);

    let sent = alerts.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].severity, AlertSeverity::Critical);
    let tail = store.inner().audit_tail(&c).await.unwrap().unwrap();
    assert_eq!(tail.action, AuditAction::RollbackEscalated);
}
