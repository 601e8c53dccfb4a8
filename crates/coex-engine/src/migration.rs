//! Migration engine
//!
//! Owns every mode change. Each operation takes the community lock, loads the
//! aggregate, validates the transition against the state-machine table,
//! checks readiness, persists the aggregate and appends to the audit chain.
//! Platform side effects of entering PARALLEL (namespace setup, first sync)
//! run only after the save, so a failed save leaves both the stored mode and
//! the platform untouched.

use crate::context::EngineContext;
use crate::grants::NamespacedGrantManager;
use crate::readiness::{ReadinessEvaluator, ReadinessReport};
use crate::strategy::{PlanStep, TransitionPlan};
use crate::telemetry;
use coex_core::{
    AuditAction, AuditEntry, CoexError, CommunityId, CommunityMigrationState, MigrationMode,
    MigrationStrategy, TransitionKind,
};
use coex_store::CommunityLock;
use serde::Serialize;
use tracing::{info, warn};

/// Actor recorded for automatic actions
pub const SYSTEM_ACTOR: &str = "system";

/// Result of one engine step that did not fail
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied {
        from: MigrationMode,
        to: MigrationMode,
    },
    NotReady(ReadinessReport),
    ConfirmationRejected,
    Unchanged {
        mode: MigrationMode,
    },
}

impl StepOutcome {
    #[inline]
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, StepOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RollbackApplied {
    pub from: MigrationMode,
    pub to: MigrationMode,
    pub rollback_count: u32,
}

pub struct MigrationEngine {
    ctx: EngineContext,
    grants: NamespacedGrantManager,
    readiness: ReadinessEvaluator,
}

impl MigrationEngine {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            grants: NamespacedGrantManager::new(ctx.clone()),
            readiness: ReadinessEvaluator::new(ctx.clone()),
            ctx,
        }
    }

    async fn locked_state(
        &self,
        community: &CommunityId,
    ) -> Result<(CommunityLock, CommunityMigrationState), CoexError> {
        let lock = self.ctx.store.lock_community(community).await?;
        let state = self
            .ctx
            .store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?;
        Ok((lock, state))
    }

    /// SHADOW -> PARALLEL behind the readiness gate, then namespace setup and
    /// a first sync
    pub async fn enable_parallel(
        &self,
        community: &CommunityId,
        strategy: MigrationStrategy,
        initial_rollout_percent: u8,
        actor: &str,
    ) -> Result<StepOutcome, CoexError> {
        let (lock, mut state) = self.locked_state(community).await?;
        self.escalate(
            &lock,
            &mut state,
            MigrationMode::Parallel,
            TransitionKind::Escalate,
            actor,
            Some((strategy, initial_rollout_percent)),
            true,
        )
        .await
    }

    /// PARALLEL -> PRIMARY behind the readiness gate
    pub async fn set_primary(&self, community: &CommunityId, actor: &str) -> Result<StepOutcome, CoexError> {
        let (lock, mut state) = self.locked_state(community).await?;
        self.escalate(
            &lock,
            &mut state,
            MigrationMode::Primary,
            TransitionKind::Escalate,
            actor,
            None,
            true,
        )
        .await
    }

    /// -> EXCLUSIVE; irreversible
    ///
    /// From PRIMARY, or from SHADOW as a direct takeover. `confirmation` must
    /// echo the community id. A community with no detected incumbent may take
    /// over from SHADOW on confirmation alone.
    pub async fn takeover(
        &self,
        community: &CommunityId,
        confirmation: Option<&str>,
        actor: &str,
    ) -> Result<StepOutcome, CoexError> {
        let (lock, mut state) = self.locked_state(community).await?;
        if state.mode().is_terminal() {
            return Err(CoexError::IrreversibleState {
                community: community.clone(),
            });
        }
        if confirmation != Some(community.as_str()) {
            warn!(community = %community, actor, "takeover confirmation mismatch");
            return Ok(StepOutcome::ConfirmationRejected);
        }
        let (kind, gated) = if state.mode() == MigrationMode::Shadow {
            let has_incumbent = self.ctx.store.load_profile(community).await?.is_some();
            (TransitionKind::OperatorOverride, has_incumbent)
        } else {
            (TransitionKind::Escalate, true)
        };
        self.escalate(&lock, &mut state, MigrationMode::Exclusive, kind, actor, None, gated)
            .await
    }

    /// Execute a plan step by step; stops at the first step that is not applied
    ///
    /// Steps already applied stay applied.
    pub async fn execute(
        &self,
        community: &CommunityId,
        plan: &TransitionPlan,
        confirmation: Option<&str>,
        actor: &str,
    ) -> Result<Vec<StepOutcome>, CoexError> {
        let mut outcomes = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let outcome = match step {
                PlanStep::EnableParallel => {
                    self.enable_parallel(community, plan.strategy, plan.initial_rollout_percent, actor)
                        .await?
                }
                PlanStep::SetPrimary => self.set_primary(community, actor).await?,
                PlanStep::Takeover => self.takeover(community, confirmation, actor).await?,
            };
            let applied = outcome.is_applied();
            outcomes.push(outcome);
            if !applied {
                break;
            }
        }
        Ok(outcomes)
    }

    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &self,
        lock: &CommunityLock,
        state: &mut CommunityMigrationState,
        to: MigrationMode,
        kind: TransitionKind,
        actor: &str,
        parallel_start: Option<(MigrationStrategy, u8)>,
        gated: bool,
    ) -> Result<StepOutcome, CoexError> {
        let community = state.community_id.clone();
        let from = state.mode();
        coex_core::state_machine::validate_transition(from, to, kind)
            .map_err(|e| CoexError::from_transition(&community, e))?;

        if gated {
            let report = self.readiness.check_state(state, to).await?;
            if !report.passed() {
                let failing: Vec<_> = report.failing().map(|c| c.detail.clone()).collect();
                warn!(community = %community, target = %to, ?failing, "transition blocked by readiness");
                return Ok(StepOutcome::NotReady(report));
            }
        }

        let now = self.ctx.now();
        state
            .apply_transition(to, kind, now)
            .map_err(|e| CoexError::from_transition(&community, e))?;
        state.readiness_check_passed = gated;
        if let Some((strategy, rollout)) = parallel_start {
            state.strategy = Some(strategy);
            state.rollout_percent = rollout;
        }

        self.ctx.store.save_state(state, lock).await?;
        let detail = if gated {
            "readiness passed".to_string()
        } else {
            "direct takeover without incumbent".to_string()
        };
        self.append_audit(&community, actor, AuditAction::ModeChanged { from, to }, detail)
            .await?;
        telemetry::record_transition(from, to);
        info!(community = %community, %from, %to, actor, "mode transition applied");

        if to == MigrationMode::Parallel {
            self.start_mirroring(state, lock).await?;
        }
        Ok(StepOutcome::Applied { from, to })
    }

    /// First namespaced sync (which sets the namespace up) for an aggregate
    /// already saved in PARALLEL
    ///
    /// Transient failures are left to the next parallel sync job; invariant
    /// violations are returned.
    async fn start_mirroring(
        &self,
        state: &mut CommunityMigrationState,
        lock: &CommunityLock,
    ) -> Result<(), CoexError> {
        match self.mirror(state, lock).await {
            Err(e) if !e.is_invariant_violation() => {
                warn!(
                    community = %state.community_id,
                    error = %e,
                    "namespaced grants deferred to the next parallel sync"
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn mirror(&self, state: &mut CommunityMigrationState, lock: &CommunityLock) -> Result<(), CoexError> {
        self.grants.sync_locked(state, lock).await?;
        self.ctx.store.save_state(state, lock).await?;
        Ok(())
    }

    /// One step back from PARALLEL or PRIMARY
    ///
    /// # Errors
    /// `IrreversibleState` from EXCLUSIVE, `Transition` from SHADOW. The stored
    /// aggregate is unchanged on error.
    pub async fn rollback(
        &self,
        community: &CommunityId,
        reason: &str,
        actor: &str,
        automatic: bool,
    ) -> Result<RollbackApplied, CoexError> {
        self.rollback_checked(community, None, reason, actor, automatic)
            .await
    }

    /// Automatic rollback of a breach observed in `expected` mode
    ///
    /// # Errors
    /// `StaleMode` when the community left `expected` between the observation
    /// and the lock; nothing is changed.
    pub async fn rollback_from(
        &self,
        community: &CommunityId,
        expected: MigrationMode,
        reason: &str,
    ) -> Result<RollbackApplied, CoexError> {
        self.rollback_checked(community, Some(expected), reason, SYSTEM_ACTOR, true)
            .await
    }

    async fn rollback_checked(
        &self,
        community: &CommunityId,
        expected: Option<MigrationMode>,
        reason: &str,
        actor: &str,
        automatic: bool,
    ) -> Result<RollbackApplied, CoexError> {
        let (lock, mut state) = self.locked_state(community).await?;
        let from = state.mode();
        if let Some(expected) = expected {
            if expected != from {
                return Err(CoexError::StaleMode {
                    community: community.clone(),
                    expected,
                    actual: from,
                });
            }
        }
        let to = state
            .apply_rollback(reason, self.ctx.now())
            .map_err(|e| CoexError::from_transition(community, e))?;
        self.ctx.store.save_state(&state, &lock).await?;
        self.append_audit(
            community,
            actor,
            AuditAction::RolledBack { from, to, automatic },
            reason,
        )
        .await?;
        telemetry::record_rollback(from, automatic);
        warn!(community = %community, %from, %to, reason, automatic, "rolled back");
        Ok(RollbackApplied {
            from,
            to,
            rollback_count: state.rollback_count,
        })
    }

    /// Force PARALLEL outside the readiness gate so namespaced grants back up
    /// a failing incumbent
    pub async fn emergency_backup(
        &self,
        community: &CommunityId,
        actor: &str,
        confirmed: bool,
    ) -> Result<StepOutcome, CoexError> {
        if !confirmed {
            return Ok(StepOutcome::ConfirmationRejected);
        }
        let (lock, mut state) = self.locked_state(community).await?;
        let from = state.mode();
        match from {
            MigrationMode::Exclusive => {
                return Err(CoexError::IrreversibleState {
                    community: community.clone(),
                })
            }
            MigrationMode::Parallel | MigrationMode::Primary => {
                return Ok(StepOutcome::Unchanged { mode: from });
            }
            MigrationMode::Shadow => {}
        }

        let now = self.ctx.now();
        state
            .apply_transition(MigrationMode::Parallel, TransitionKind::Escalate, now)
            .map_err(|e| CoexError::from_transition(community, e))?;
        state.strategy.get_or_insert(MigrationStrategy::Instant);
        state.rollout_percent = 100;
        state.readiness_check_passed = false;
        self.ctx.store.save_state(&state, &lock).await?;
        self.append_audit(
            community,
            actor,
            AuditAction::EmergencyBackup { from },
            "readiness gate bypassed",
        )
        .await?;
        telemetry::record_transition(from, MigrationMode::Parallel);
        warn!(community = %community, actor, "emergency backup activated");
        self.start_mirroring(&mut state, &lock).await?;
        Ok(StepOutcome::Applied {
            from,
            to: MigrationMode::Parallel,
        })
    }

    pub(crate) async fn append_audit(
        &self,
        community: &CommunityId,
        actor: &str,
        action: AuditAction,
        detail: impl Into<String>,
    ) -> Result<(), CoexError> {
        let tail = self.ctx.store.audit_tail(community).await?;
        let entry = AuditEntry::chained(
            tail.as_ref(),
            community.clone(),
            self.ctx.now(),
            actor,
            action,
            detail,
        );
        self.ctx.store.append_audit(&entry).await?;
        Ok(())
    }
}
