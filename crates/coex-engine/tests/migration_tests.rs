mod common;

use coex_core::{
    verify_chain, AuditAction, CoexError, EligibilityResult, MemberId, MigrationMode,
    MigrationStrategy,
};
use coex_engine::grants::NamespacedGrantManager;
use coex_engine::profiler::IncumbentProfiler;
use coex_engine::readiness::CheckKind;
use coex_engine::{
    EmergencyOutcome, EngineContext, JobKind, JobRunner, MigrationEngine, ModeChangeOutcome,
    RollbackOutcome,
};
use coex_store::{InMemoryStore, MigrationStore};
use coex_test_utils::{
    collabland_platform, community, t0, test_config, FailingStore, FakeEligibility,
    FakeIdentities, FakePlatform, ManualClock, RecordingAlerts,
};
use common::{member_name, Harness};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn parallel_is_gated_on_shadow_duration() {
    let h = Harness::aligned(10);
    h.detect().await;
    h.shadow_days(5).await;

    let outcome = h
        .control()
        .request_mode_change(&h.community, MigrationMode::Parallel, MigrationStrategy::Instant, None, "op")
        .await
        .unwrap();
    let ModeChangeOutcome::RejectedNotReady(report) = outcome else {
        panic!("expected readiness rejection, got {outcome:?}");
    };
    let failing: Vec<_> = report.failing().map(|c| c.kind).collect();
    assert_eq!(failing, vec![CheckKind::ShadowDuration]);
    assert_eq!(h.state().await.mode(), MigrationMode::Shadow);
    assert_eq!(h.platform.mutation_count(), 0);

    h.shadow_days(9).await;
    let outcome = h
        .control()
        .request_mode_change(&h.community, MigrationMode::Parallel, MigrationStrategy::Instant, None, "op")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ModeChangeOutcome::Success {
            from: MigrationMode::Shadow,
            to: MigrationMode::Parallel
        }
    );

    let state = h.state().await;
    assert_eq!(state.mode(), MigrationMode::Parallel);
    assert_eq!(state.strategy, Some(MigrationStrategy::Instant));
    assert!(state.parallel_enabled_at.is_some());
    assert!(h.platform.grant_by_name(&h.community, "coex-Holder").is_some());
    let holdings = h
        .platform
        .member_grant_names(&h.community, &MemberId::from(member_name(0).as_str()));
    assert!(holdings.contains("Holder"));
    assert!(holdings.contains("coex-Holder"));
}

#[tokio::test]
async fn status_reports_next_mode_readiness() {
    let h = Harness::aligned(4);
    h.detect().await;
    h.shadow_days(2).await;

    let status = h.control().get_status(&h.community).await.unwrap();
    assert_eq!(status.mode, MigrationMode::Shadow);
    assert_eq!(status.incumbent_provider.as_deref(), Some("collabland"));
    assert_eq!(status.divergence_count, 0);
    assert!((status.shadow_accuracy - 100.0).abs() < f64::EPSILON);
    let readiness = status.readiness.expect("SHADOW has a next mode");
    assert_eq!(readiness.target, MigrationMode::Parallel);
    assert!(!readiness.passed());
}

#[tokio::test]
async fn exclusive_is_irreversible() {
    let h = Harness::aligned(3);
    h.detect().await;
    h.force_mode(MigrationMode::Exclusive).await;
    let before = h.state().await;
    let control = h.control();

    assert_eq!(
        control.rollback(&h.community, "second thoughts", "op").await.unwrap(),
        RollbackOutcome::RejectedFromExclusive
    );
    assert_eq!(
        control
            .request_mode_change(&h.community, MigrationMode::Parallel, MigrationStrategy::Instant, None, "op")
            .await
            .unwrap(),
        ModeChangeOutcome::RejectedIrreversible
    );
    assert_eq!(
        control.trigger_emergency_backup(&h.community, "op", true).await.unwrap(),
        EmergencyOutcome::RejectedIrreversible
    );

    let after = h.state().await;
    assert_eq!(after, before);
    assert_eq!(after.rollback_count, 0);
    assert!(h.store.audit_log(&h.community).await.unwrap().is_empty());
}

#[tokio::test]
async fn rollback_steps_back_once_and_counts() {
    let h = Harness::aligned(3);
    h.detect().await;
    let control = h.control();

    assert_eq!(
        control.rollback(&h.community, "nothing yet", "op").await.unwrap(),
        RollbackOutcome::RejectedNothingToRollBack
    );

    h.force_mode(MigrationMode::Primary).await;
    assert_eq!(
        control.rollback(&h.community, "members complaining", "op").await.unwrap(),
        RollbackOutcome::Success {
            from: MigrationMode::Primary,
            to: MigrationMode::Parallel,
            rollback_count: 1
        }
    );
    assert_eq!(
        control.rollback(&h.community, "still bad", "op").await.unwrap(),
        RollbackOutcome::Success {
            from: MigrationMode::Parallel,
            to: MigrationMode::Shadow,
            rollback_count: 2
        }
    );

    let state = h.state().await;
    assert_eq!(state.mode(), MigrationMode::Shadow);
    assert_eq!(state.last_rollback_reason.as_deref(), Some("still bad"));
    assert_eq!(state.last_rollback_at, Some(h.now()));
}

#[tokio::test]
async fn new_system_primary_applies_what_is_ready() {
    let h = Harness::aligned(6);
    h.detect().await;
    h.shadow_days(14).await;

    let outcome = h
        .control()
        .request_mode_change(
            &h.community,
            MigrationMode::Primary,
            MigrationStrategy::NewSystemPrimary,
            None,
            "op",
        )
        .await
        .unwrap();
    let ModeChangeOutcome::Partial { reached, blocked } = outcome else {
        panic!("expected partial application, got {outcome:?}");
    };
    assert_eq!(reached, MigrationMode::Parallel);
    assert_eq!(blocked.target, MigrationMode::Primary);
    assert!(!blocked.check(CheckKind::ShadowDuration).unwrap().passed);
    assert_eq!(h.state().await.mode(), MigrationMode::Parallel);
}

#[tokio::test]
async fn parallel_forever_pins_the_community() {
    let h = Harness::aligned(4);
    h.detect().await;
    h.shadow_days(14).await;
    let control = h.control();

    let outcome = control
        .request_mode_change(
            &h.community,
            MigrationMode::Parallel,
            MigrationStrategy::ParallelForever,
            None,
            "op",
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ModeChangeOutcome::Success { .. }));

    let outcome = control
        .request_mode_change(&h.community, MigrationMode::Primary, MigrationStrategy::Instant, None, "op")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ModeChangeOutcome::RejectedByStrategy {
            strategy: MigrationStrategy::ParallelForever,
            target: MigrationMode::Primary
        }
    );
}

#[tokio::test]
async fn skipping_a_mode_is_rejected() {
    let h = Harness::aligned(2);
    h.detect().await;
    let outcome = h
        .control()
        .request_mode_change(&h.community, MigrationMode::Primary, MigrationStrategy::Instant, None, "op")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ModeChangeOutcome::RejectedInvalidTransition {
            from: MigrationMode::Shadow,
            to: MigrationMode::Primary
        }
    );
}

#[tokio::test]
async fn takeover_requires_echoed_community_id() {
    let c = community();
    let h = Harness::new(FakePlatform::new().with_channel(&c, "general").with_member(&c, "a", &[]));
    assert!(h.detect().await.is_none());
    let control = h.control();

    let wrong = control
        .request_mode_change(&c, MigrationMode::Exclusive, MigrationStrategy::Instant, Some("guild-2"), "op")
        .await
        .unwrap();
    assert_eq!(wrong, ModeChangeOutcome::RejectedConfirmation);

    let right = control
        .request_mode_change(&c, MigrationMode::Exclusive, MigrationStrategy::Instant, Some("guild-1"), "op")
        .await
        .unwrap();
    assert_eq!(
        right,
        ModeChangeOutcome::Success {
            from: MigrationMode::Shadow,
            to: MigrationMode::Exclusive
        }
    );
    assert!(h.state().await.exclusive_enabled_at.is_some());
}

#[tokio::test]
async fn takeover_over_live_incumbent_is_gated() {
    let h = Harness::aligned(3);
    h.detect().await;
    h.shadow_days(3).await;

    let outcome = h
        .control()
        .request_mode_change(&h.community, MigrationMode::Exclusive, MigrationStrategy::Instant, Some("guild-1"), "op")
        .await
        .unwrap();
    assert!(matches!(outcome, ModeChangeOutcome::RejectedNotReady(ref r) if r.target == MigrationMode::Exclusive));
    assert_eq!(h.state().await.mode(), MigrationMode::Shadow);
}

#[tokio::test]
async fn emergency_backup_forces_parallel() {
    let h = Harness::aligned(5);
    h.detect().await;
    h.shadow_days(1).await;
    let control = h.control();

    assert_eq!(
        control.trigger_emergency_backup(&h.community, "op", false).await.unwrap(),
        EmergencyOutcome::RejectedUnconfirmed
    );
    assert_eq!(h.state().await.mode(), MigrationMode::Shadow);

    assert_eq!(
        control.trigger_emergency_backup(&h.community, "op", true).await.unwrap(),
        EmergencyOutcome::Activated {
            from: MigrationMode::Shadow
        }
    );
    let state = h.state().await;
    assert_eq!(state.mode(), MigrationMode::Parallel);
    assert_eq!(state.rollout_percent, 100);
    assert!(!state.readiness_check_passed);
    for i in 0..5 {
        let holdings = h
            .platform
            .member_grant_names(&h.community, &MemberId::from(member_name(i).as_str()));
        assert!(holdings.contains("coex-Holder"), "{} missing backup grant", member_name(i));
    }

    assert_eq!(
        control.trigger_emergency_backup(&h.community, "op", true).await.unwrap(),
        EmergencyOutcome::AlreadyActive {
            mode: MigrationMode::Parallel
        }
    );
}

#[tokio::test]
async fn gradual_rollout_widens_each_sync() {
    let h = Harness::aligned(40);
    h.detect().await;
    h.shadow_days(14).await;

    let outcome = h
        .control()
        .request_mode_change(&h.community, MigrationMode::Parallel, MigrationStrategy::Gradual, None, "op")
        .await
        .unwrap();
    assert!(matches!(outcome, ModeChangeOutcome::Success { .. }));
    assert_eq!(h.state().await.rollout_percent, 20);

    let holders = |h: &Harness| {
        (0..40)
            .filter(|i| {
                h.platform
                    .member_grant_names(&h.community, &MemberId::from(member_name(*i).as_str()))
                    .contains("coex-Holder")
            })
            .count()
    };
    let grants = NamespacedGrantManager::new(h.ctx.clone());
    let mut previous = holders(&h);
    for _ in 0..9 {
        let report = grants.sync(&h.community).await.unwrap();
        assert_eq!(report.removed, 0);
        let now_holding = holders(&h);
        assert!(now_holding >= previous);
        previous = now_holding;
    }
    assert_eq!(h.state().await.rollout_percent, 100);
    assert_eq!(previous, 40);
}

#[tokio::test]
async fn audit_chain_records_every_change() {
    let h = Harness::aligned(3);
    h.detect().await;
    h.shadow_days(14).await;
    let control = h.control();
    control
        .request_mode_change(&h.community, MigrationMode::Parallel, MigrationStrategy::Instant, None, "alice")
        .await
        .unwrap();
    control.rollback(&h.community, "drill", "bob").await.unwrap();

    let trail = control.audit_trail(&h.community).await.unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].sequence, 0);
    assert_eq!(trail[0].actor, "alice");
    assert_eq!(
        trail[0].action,
        AuditAction::ModeChanged {
            from: MigrationMode::Shadow,
            to: MigrationMode::Parallel
        }
    );
    assert_eq!(
        trail[1].action,
        AuditAction::RolledBack {
            from: MigrationMode::Parallel,
            to: MigrationMode::Shadow,
            automatic: false
        }
    );
    assert_eq!(trail[1].hash.len(), 64);

    let mut chain = h.store.audit_log(&h.community).await.unwrap();
    assert!(verify_chain(&chain).is_ok());
    chain[0].detail = "rewritten".to_string();
    assert!(verify_chain(&chain).is_err());
}

#[tokio::test]
async fn failed_save_leaves_the_platform_untouched() {
    let c = community();
    let platform = Arc::new(collabland_platform(&c, t0()).with_member(&c, "m000", &["Holder"]));
    let store = Arc::new(FailingStore::new(InMemoryStore::new()));
    let eligibility = Arc::new(FakeEligibility::new());
    let identities = Arc::new(FakeIdentities::new());
    identities.link("m000", "wallet-m000");
    eligibility.set("wallet-m000", EligibilityResult::eligible("Holder", 1.0));
    let ctx = EngineContext::new(
        store.clone(),
        platform.clone(),
        eligibility,
        identities,
        Arc::new(RecordingAlerts::new()),
    )
    .with_clock(Arc::new(ManualClock::new(t0())))
    .with_config(test_config());
    IncumbentProfiler::new(ctx.clone()).unwrap().detect(&c).await.unwrap();
    let engine = MigrationEngine::new(ctx);

    store.fail_state_writes(true);
    let err = engine.emergency_backup(&c, "op", true).await.unwrap_err();
    assert!(matches!(err, CoexError::Store(_)));
    assert_eq!(platform.mutation_count(), 0);
    assert_eq!(store.load_state(&c).await.unwrap().unwrap().mode(), MigrationMode::Shadow);
    assert!(store.audit_log(&c).await.unwrap().is_empty());

    store.fail_state_writes(false);
    assert!(engine.emergency_backup(&c, "op", true).await.unwrap().is_applied());
    assert!(platform
        .member_grant_names(&c, &MemberId::from("m000"))
        .contains("coex-Holder"));
}

#[tokio::test]
async fn grants_follow_once_the_platform_recovers() {
    let h = Harness::aligned(3);
    h.detect().await;
    h.platform.set_unavailable(true);

    let outcome = h
        .control()
        .trigger_emergency_backup(&h.community, "op", true)
        .await
        .unwrap();
    assert_eq!(outcome, EmergencyOutcome::Activated { from: MigrationMode::Shadow });
    assert_eq!(h.state().await.mode(), MigrationMode::Parallel);
    assert_eq!(h.platform.mutation_count(), 0);

    h.platform.set_unavailable(false);
    JobRunner::new(h.ctx.clone())
        .run(&h.community, JobKind::ParallelSync)
        .await
        .unwrap();
    assert!(h.platform.grant_by_name(&h.community, "coex-Holder").is_some());
    for i in 0..3 {
        let holdings = h
            .platform
            .member_grant_names(&h.community, &MemberId::from(member_name(i).as_str()));
        assert!(holdings.contains("coex-Holder"));
    }
}

#[tokio::test]
async fn automatic_rollback_refuses_a_moved_mode() {
    let h = Harness::aligned(3);
    h.detect().await;
    h.force_mode(MigrationMode::Primary).await;
    let control = h.control();

    // An operator steps back after the breach was observed in PRIMARY.
    control.rollback(&h.community, "operator call", "op").await.unwrap();
    let err = control
        .engine()
        .rollback_from(&h.community, MigrationMode::Primary, "access loss")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoexError::StaleMode {
            expected: MigrationMode::Primary,
            actual: MigrationMode::Parallel,
            ..
        }
    ));

    let state = h.state().await;
    assert_eq!(state.mode(), MigrationMode::Parallel);
    assert_eq!(state.rollback_count, 1);
    assert_eq!(state.last_rollback_reason.as_deref(), Some("operator call"));
}

#[tokio::test]
async fn readiness_rejection_writes_nothing() {
    let h = Harness::aligned(10);
    h.detect().await;
    h.shadow_days(5).await;
    let before = h.state().await;
    let audit_before = h.store.audit_log(&h.community).await.unwrap().len();

    let outcome = h
        .control()
        .request_mode_change(&h.community, MigrationMode::Parallel, MigrationStrategy::Instant, None, "op")
        .await
        .unwrap();
    assert!(matches!(outcome, ModeChangeOutcome::RejectedNotReady(_)));
    assert_eq!(h.state().await, before);
    assert_eq!(h.store.audit_log(&h.community).await.unwrap().len(), audit_before);
}
