//! Readiness evaluation
//!
//! Three checks gate every escalation: time spent in shadow, shadow accuracy,
//! and absence of unresolved divergences in a trailing window. Evaluation is
//! read-only and takes no lock.

use crate::context::EngineContext;
use chrono::{DateTime, Duration, Utc};
use coex_core::{
    CoexError, CommunityId, CommunityMigrationState, Divergence, MigrationMode,
    ReadinessThresholds,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    ShadowDuration,
    Accuracy,
    OpenDivergences,
}

/// One check with the measured and required values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadinessCheck {
    pub kind: CheckKind,
    pub passed: bool,
    pub current: f64,
    pub required: f64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadinessReport {
    pub community_id: CommunityId,
    pub target: MigrationMode,
    pub checks: Vec<ReadinessCheck>,
    pub evaluated_at: DateTime<Utc>,
}

impl ReadinessReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failing(&self) -> impl Iterator<Item = &ReadinessCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    #[must_use]
    pub fn check(&self, kind: CheckKind) -> Option<&ReadinessCheck> {
        self.checks.iter().find(|c| c.kind == kind)
    }
}

/// Pure evaluation over an already-loaded state and divergence history
#[must_use]
pub fn evaluate(
    state: &CommunityMigrationState,
    target: MigrationMode,
    thresholds: ReadinessThresholds,
    divergences: &[Divergence],
    now: DateTime<Utc>,
) -> ReadinessReport {
    #[allow(clippy::cast_precision_loss)]
    let days = state
        .shadow_started_at
        .map_or(0.0, |start| (now - start).num_seconds().max(0) as f64 / 86_400.0);
    let required_days = f64::from(thresholds.min_shadow_days);

    let window_start = now - Duration::hours(i64::from(thresholds.divergence_window_hours));
    let open = divergences
        .iter()
        .filter(|d| d.is_unresolved() && d.detected_at >= window_start)
        .count();
    #[allow(clippy::cast_precision_loss)]
    let open_count = open as f64;

    let checks = vec![
        ReadinessCheck {
            kind: CheckKind::ShadowDuration,
            passed: days >= required_days,
            current: days,
            required: required_days,
            detail: format!(
                "{days:.1} days in shadow, {} required",
                thresholds.min_shadow_days
            ),
        },
        ReadinessCheck {
            kind: CheckKind::Accuracy,
            passed: state.accuracy_percent >= thresholds.min_accuracy_percent,
            current: state.accuracy_percent,
            required: thresholds.min_accuracy_percent,
            detail: format!(
                "accuracy {:.1}%, {:.1}% required",
                state.accuracy_percent, thresholds.min_accuracy_percent
            ),
        },
        ReadinessCheck {
            kind: CheckKind::OpenDivergences,
            passed: open == 0,
            current: open_count,
            required: 0.0,
            detail: format!(
                "{open} unresolved divergences in the last {}h",
                thresholds.divergence_window_hours
            ),
        },
    ];

    ReadinessReport {
        community_id: state.community_id.clone(),
        target,
        checks,
        evaluated_at: now,
    }
}

pub struct ReadinessEvaluator {
    ctx: EngineContext,
}

impl ReadinessEvaluator {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Readiness of `community` for `target`, without taking the lock
    pub async fn check(
        &self,
        community: &CommunityId,
        target: MigrationMode,
    ) -> Result<ReadinessReport, CoexError> {
        let state = self
            .ctx
            .store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?;
        self.check_state(&state, target).await
    }

    /// Readiness over a state the caller already holds
    pub async fn check_state(
        &self,
        state: &CommunityMigrationState,
        target: MigrationMode,
    ) -> Result<ReadinessReport, CoexError> {
        let now = self.ctx.now();
        let thresholds = self.ctx.config.readiness.for_target(target);
        let since = now - Duration::hours(i64::from(thresholds.divergence_window_hours));
        let divergences = self
            .ctx
            .store
            .list_divergences(&state.community_id, Some(since))
            .await?;
        Ok(evaluate(state, target, thresholds, &divergences, now))
    }
}
