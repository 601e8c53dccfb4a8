mod common;

use chrono::Duration;
use coex_core::{
    CoexError, DivergenceKind, DivergenceResolution, DivergenceStatus, InvariantViolation,
    MemberId, MigrationMode, PredictionOutcome, PredictionType,
};
use coex_engine::ledger::ShadowLedger;
use coex_store::MigrationStore;
use coex_test_utils::{collabland_platform, community, t0};
use common::{member_name, Harness};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[tokio::test]
async fn agreeing_incumbent_scores_full_accuracy() {
    let h = Harness::aligned(10);
    h.detect().await.expect("collabland detected");
    let report = h.shadow_days(1).await.unwrap();

    assert_eq!(report.processed, 10);
    assert_eq!(report.matches, 10);
    assert_eq!(report.divergences_opened, 0);
    assert!((report.accuracy_percent - 100.0).abs() < f64::EPSILON);
    assert_eq!(h.platform.mutation_count(), 0);

    let state = h.state().await;
    assert_eq!(state.mode(), MigrationMode::Shadow);
    assert_eq!(state.last_shadow_sync_at, Some(h.now()));
}

#[tokio::test]
async fn repeated_sync_without_changes_is_stable() {
    let h = Harness::aligned(8);
    h.link(&member_name(0), None);
    h.link(&member_name(1), None);
    h.detect().await;

    let first = h.shadow_days(1).await.unwrap();
    let second = h.shadow_days(1).await.unwrap();

    assert_eq!(first.divergent, 2);
    assert_eq!(first.divergences_opened, 2);
    assert_eq!(second.divergences_opened, 0);
    assert_eq!(second.predictions_opened, 0);
    assert!((first.accuracy_percent - second.accuracy_percent).abs() < f64::EPSILON);
    assert!((second.accuracy_percent - 75.0).abs() < 1e-9);

    let open = h
        .store
        .list_divergences(&h.community, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.is_unresolved())
        .count();
    assert_eq!(open, 2);
}

#[tokio::test]
async fn sync_refuses_outside_shadow() {
    let h = Harness::aligned(3);
    h.detect().await;
    h.force_mode(MigrationMode::Parallel).await;

    let err = ShadowLedger::new(h.ctx.clone())
        .sync(&h.community)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoexError::Invariant(InvariantViolation::ShadowOutsideShadowMode { .. })
    ));
    assert!(err.is_invariant_violation());
    assert_eq!(h.platform.mutation_count(), 0);
}

#[tokio::test]
async fn too_many_member_failures_discard_the_snapshot() {
    let h = Harness::aligned(10);
    h.detect().await;
    h.platform.fail_member(&MemberId::from(member_name(0).as_str()));
    h.platform.fail_member(&MemberId::from(member_name(1).as_str()));

    h.advance(Duration::days(1));
    let err = ShadowLedger::new(h.ctx.clone())
        .sync(&h.community)
        .await
        .unwrap_err();
    assert!(matches!(err, CoexError::SyncIncomplete { failed: 2, total: 10, .. }));

    let state = h.state().await;
    assert_eq!(state.last_shadow_sync_at, None);
    assert!(state.accuracy_percent.abs() < f64::EPSILON);
}

#[tokio::test]
async fn slow_member_times_out_without_blocking_the_rest() {
    let mut config = coex_test_utils::test_config();
    config.shadow.member_timeout_secs = 1;
    config.shadow.max_member_failure_ratio = 0.2;
    let c = community();
    let mut platform = collabland_platform(&c, t0());
    for i in 0..10 {
        platform = platform.with_member(&c, &member_name(i), &["Holder"]);
    }
    let h = Harness::with_config(platform, config);
    for i in 0..10 {
        h.link(&member_name(i), Some("Holder"));
    }
    h.detect().await;
    h.platform
        .slow_member(&MemberId::from(member_name(3).as_str()), std::time::Duration::from_secs(5));

    let report = h.shadow_days(1).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 9);
}

#[tokio::test]
async fn incumbent_catching_up_resolves_and_confirms() {
    let c = community();
    let platform = collabland_platform(&c, t0()).with_member(&c, "late", &[]);
    let h = Harness::new(platform);
    h.link("late", Some("Holder"));
    h.detect().await;

    let first = h.shadow_days(1).await.unwrap();
    assert_eq!(first.divergences_opened, 1);
    assert_eq!(first.predictions_opened, 1);
    let record = h
        .store
        .load_member_record(&c, &MemberId::from("late"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.divergence_status, DivergenceStatus::NewSystemHigher);
    assert!(record.would_grant.contains("coex-Holder"));

    h.platform
        .set_member_grants(&c, &MemberId::from("late"), &["Holder"]);
    let second = h.shadow_days(1).await.unwrap();
    assert_eq!(second.divergences_resolved, 1);
    assert_eq!(second.predictions_confirmed, 1);

    let divergences = h.store.list_divergences(&c, None).await.unwrap();
    assert_eq!(divergences.len(), 1);
    assert_eq!(divergences[0].kind, DivergenceKind::NewSystemHigher);
    assert_eq!(divergences[0].resolution, Some(DivergenceResolution::IncumbentMatched));
    assert_eq!(divergences[0].resolved_at, Some(h.now()));

    let predictions = h.store.list_predictions(&c, None).await.unwrap();
    assert_eq!(predictions.len(), 1);
    assert_eq!(predictions[0].prediction_type, PredictionType::IncumbentWillGrant);
    assert_eq!(predictions[0].outcome, PredictionOutcome::Correct);
}

#[tokio::test]
async fn stale_predictions_expire_as_incorrect() {
    let c = community();
    let platform = collabland_platform(&c, t0()).with_member(&c, "stuck", &[]);
    let h = Harness::new(platform);
    h.link("stuck", Some("Holder"));
    h.detect().await;

    h.shadow_days(1).await;
    // Prediction window is a week; the incumbent never grants.
    let report = h.shadow_days(8).await.unwrap();
    assert!(report.predictions_expired >= 1);

    let summary = h.control().prediction_summary(&c).await.unwrap();
    assert_eq!(summary.incorrect, 1);
    assert_eq!(summary.correct, 0);
    assert_eq!(summary.accuracy_percent, Some(0.0));
}

#[derive(Debug, Clone)]
struct SimMember {
    incumbent_holder: bool,
    linked: bool,
    eligible: bool,
}

fn sim_member() -> impl Strategy<Value = SimMember> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(incumbent_holder, linked, eligible)| {
        SimMember {
            incumbent_holder,
            linked,
            eligible,
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_shadow_never_mutates(
        members in prop::collection::vec(sim_member(), 0..30),
        flips in prop::collection::vec(any::<bool>(), 30),
        days in 1u32..4,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let c = community();
            let mut platform = collabland_platform(&c, t0());
            for (i, m) in members.iter().enumerate() {
                let grants: &[&str] = if m.incumbent_holder { &["Holder"] } else { &[] };
                platform = platform.with_member(&c, &member_name(i), grants);
            }
            let h = Harness::new(platform);
            for (i, m) in members.iter().enumerate() {
                if m.linked {
                    h.link(&member_name(i), m.eligible.then_some("Holder"));
                }
            }
            h.detect().await;

            for day in 0..days {
                let report = h.shadow_days(1).await.unwrap();
                prop_assert!((0.0..=100.0).contains(&report.accuracy_percent));
                prop_assert_eq!(report.processed, members.len());
                // Eligibility drifts between days; the ledger still only reads.
                for (i, m) in members.iter().enumerate() {
                    if m.linked && flips[(i + day as usize) % flips.len()] {
                        h.set_tier(&member_name(i), (!m.eligible).then_some("Holder"));
                    }
                }
            }
            prop_assert_eq!(h.platform.mutation_count(), 0);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn flipped_divergence_is_closed_and_reopened() {
    let c = community();
    let platform = collabland_platform(&c, t0()).with_member(&c, "flip", &[]);
    let h = Harness::new(platform);
    h.link("flip", Some("Holder"));
    h.detect().await;
    let member = MemberId::from("flip");

    h.shadow_days(1).await;
    let open = h.store.open_divergences(&c, &member).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, DivergenceKind::NewSystemHigher);
    let first = open[0].id;

    // Incumbent grants access just as the new system withdraws it.
    h.platform.set_member_grants(&c, &member, &["Holder"]);
    h.set_tier("flip", None);
    let report = h.shadow_days(1).await.unwrap();
    assert_eq!(report.divergences_opened, 1);
    assert_eq!(report.divergences_resolved, 1);

    let open = h.store.open_divergences(&c, &member).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, DivergenceKind::NewSystemLower);
    assert_ne!(open[0].id, first);

    let all = h.store.list_divergences(&c, None).await.unwrap();
    let closed = all.iter().find(|d| d.id == first).unwrap();
    assert_eq!(closed.resolution, Some(DivergenceResolution::StillDivergent));
    assert_eq!(closed.resolved_at, Some(h.now()));
}

#[tokio::test]
async fn unlinked_member_keeps_open_divergences() {
    let c = community();
    let platform = collabland_platform(&c, t0()).with_member(&c, "drifter", &["Holder"]);
    let h = Harness::new(platform);
    h.link("drifter", None);
    h.detect().await;
    let member = MemberId::from("drifter");

    h.shadow_days(1).await;
    let before = h.store.open_divergences(&c, &member).await.unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].kind, DivergenceKind::NewSystemLower);

    h.identities.unlink("drifter");
    let report = h.shadow_days(1).await.unwrap();
    assert_eq!(report.unknown, 1);
    assert_eq!(report.divergences_opened, 0);
    assert_eq!(report.divergences_resolved, 0);

    let record = h.store.load_member_record(&c, &member).await.unwrap().unwrap();
    assert_eq!(record.divergence_status, DivergenceStatus::Unknown);
    let after = h.store.open_divergences(&c, &member).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].resolved_at, None);
}
