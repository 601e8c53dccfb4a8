//! End-to-end scenarios over the in-memory collaborators

mod common;

use chrono::Duration;
use coex_core::{
    AuditAction, DivergenceKind, DivergenceResolution, DivergenceStatus, MemberId, MigrationMode,
    MigrationStrategy,
};
use coex_engine::grants::NamespacedGrantManager;
use coex_engine::readiness::CheckKind;
use coex_engine::watcher::{RollbackWatcher, WatchOutcome};
use coex_engine::{ModeChangeOutcome, SYSTEM_ACTOR};
use coex_store::MigrationStore;
use coex_test_utils::{collabland_platform, community, t0};
use common::{member_name, Harness};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn no_linked_identities_never_promotes() {
    let c = community();
    let mut platform = collabland_platform(&c, t0());
    for i in 0..6 {
        platform = platform.with_member(&c, &member_name(i), &["Holder"]);
    }
    let h = Harness::new(platform);
    h.detect().await;

    let report = h.shadow_days(14).await.unwrap();
    assert_eq!(report.unknown, 6);
    assert_eq!(report.matches + report.divergent, 0);
    assert!(report.accuracy_percent.abs() < f64::EPSILON);

    let records = h.store.list_member_records(&c).await.unwrap();
    assert_eq!(records.len(), 6);
    assert!(records
        .iter()
        .all(|r| r.divergence_status == DivergenceStatus::Unknown));
    assert!(h.store.list_divergences(&c, None).await.unwrap().is_empty());

    let outcome = h
        .control()
        .request_mode_change(&c, MigrationMode::Parallel, MigrationStrategy::Instant, None, "op")
        .await
        .unwrap();
    let ModeChangeOutcome::RejectedNotReady(readiness) = outcome else {
        panic!("expected readiness rejection, got {outcome:?}");
    };
    assert!(readiness.check(CheckKind::ShadowDuration).unwrap().passed);
    assert!(readiness.check(CheckKind::OpenDivergences).unwrap().passed);
    assert!(!readiness.check(CheckKind::Accuracy).unwrap().passed);
    assert_eq!(h.state().await.mode(), MigrationMode::Shadow);
}

#[tokio::test]
async fn rising_score_resolves_new_system_lower() {
    let c = community();
    let platform = collabland_platform(&c, t0()).with_member(&c, "whale", &["Holder"]);
    let h = Harness::new(platform);
    h.link("whale", None);
    h.detect().await;

    h.shadow_days(1).await;
    let open = h.store.open_divergences(&c, &MemberId::from("whale")).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, DivergenceKind::NewSystemLower);
    assert!(open[0].incumbent_state.contains("Holder"));
    assert_eq!(open[0].new_system_state, None);

    h.set_tier("whale", Some("Holder"));
    let report = h.shadow_days(1).await.unwrap();
    assert_eq!(report.matches, 1);
    assert_eq!(report.divergences_resolved, 1);

    let record = h
        .store
        .load_member_record(&c, &MemberId::from("whale"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.divergence_status, DivergenceStatus::Match);

    let all = h.store.list_divergences(&c, None).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].resolved_at, Some(h.now()));
    assert_eq!(all[0].resolution, Some(DivergenceResolution::NewSystemWrong));
}

#[tokio::test]
async fn access_loss_triggers_automatic_rollback() {
    let h = Harness::aligned(50);
    h.detect().await;
    h.shadow_days(14).await;
    let outcome = h
        .control()
        .request_mode_change(&h.community, MigrationMode::Parallel, MigrationStrategy::Instant, None, "op")
        .await
        .unwrap();
    assert!(matches!(outcome, ModeChangeOutcome::Success { .. }));

    h.advance(Duration::minutes(10));
    for i in 0..6 {
        h.set_tier(&member_name(i), None);
    }
    let sync = NamespacedGrantManager::new(h.ctx.clone())
        .sync(&h.community)
        .await
        .unwrap();
    assert_eq!(sync.removed, 6);

    let outcome = RollbackWatcher::new(h.ctx.clone())
        .evaluate(&h.community)
        .await
        .unwrap();
    let WatchOutcome::RolledBack {
        rates,
        reason,
        rollback,
    } = outcome
    else {
        panic!("expected rollback, got {outcome:?}");
    };
    assert!((rates.access_loss_percent - 12.0).abs() < 1e-9);
    assert!(reason.contains("12.0%"), "{reason}");
    assert_eq!(rollback.from, MigrationMode::Parallel);
    assert_eq!(rollback.to, MigrationMode::Shadow);
    assert_eq!(rollback.rollback_count, 1);

    let state = h.state().await;
    assert_eq!(state.mode(), MigrationMode::Shadow);
    assert_eq!(state.rollback_count, 1);

    let audit = h.store.audit_tail(&h.community).await.unwrap().unwrap();
    assert_eq!(audit.actor, SYSTEM_ACTOR);
    assert_eq!(
        audit.action,
        AuditAction::RolledBack {
            from: MigrationMode::Parallel,
            to: MigrationMode::Shadow,
            automatic: true
        }
    );

    // Samples from before the rollback no longer count.
    let again = RollbackWatcher::new(h.ctx.clone())
        .evaluate(&h.community)
        .await
        .unwrap();
    assert_eq!(again, WatchOutcome::Inactive { mode: MigrationMode::Shadow });
}

#[tokio::test]
async fn small_losses_stay_below_threshold() {
    let h = Harness::aligned(50);
    h.detect().await;
    h.shadow_days(14).await;
    h.control()
        .request_mode_change(&h.community, MigrationMode::Parallel, MigrationStrategy::Instant, None, "op")
        .await
        .unwrap();

    h.advance(Duration::minutes(5));
    h.set_tier(&member_name(0), None);
    NamespacedGrantManager::new(h.ctx.clone())
        .sync(&h.community)
        .await
        .unwrap();

    let outcome = RollbackWatcher::new(h.ctx.clone())
        .evaluate(&h.community)
        .await
        .unwrap();
    let WatchOutcome::Healthy(rates) = outcome else {
        panic!("expected healthy, got {outcome:?}");
    };
    assert!((rates.access_loss_percent - 2.0).abs() < 1e-9);
    assert_eq!(h.state().await.mode(), MigrationMode::Parallel);
}
