//! Operator control surface
//!
//! Transport-agnostic: every operation returns a typed outcome. Business
//! rejections are outcomes, infrastructure failures are errors.

use crate::context::EngineContext;
use crate::migration::{MigrationEngine, StepOutcome};
use crate::readiness::{ReadinessEvaluator, ReadinessReport};
use crate::strategy::{self, PlanRejection};
use chrono::{DateTime, Utc};
use coex_core::{
    AuditEntry, CoexError, CommunityId, Divergence, HealthStatus, MigrationMode,
    MigrationStrategy, PredictionOutcome, TransitionError,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommunityStatus {
    pub community_id: CommunityId,
    pub mode: MigrationMode,
    pub strategy: Option<MigrationStrategy>,
    pub incumbent_provider: Option<String>,
    pub incumbent_health: HealthStatus,
    pub shadow_accuracy: f64,
    /// Unresolved divergences, whole history
    pub divergence_count: usize,
    /// Readiness for the next mode, if there is one
    pub readiness: Option<ReadinessReport>,
    pub rollback_count: u32,
    pub rollout_percent: u8,
    pub last_shadow_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ModeChangeOutcome {
    Success {
        from: MigrationMode,
        to: MigrationMode,
    },
    /// Earlier steps of the plan were applied, a later one was not ready
    Partial {
        reached: MigrationMode,
        blocked: ReadinessReport,
    },
    RejectedNotReady(ReadinessReport),
    RejectedIrreversible,
    RejectedInvalidTransition {
        from: MigrationMode,
        to: MigrationMode,
    },
    RejectedConfirmation,
    RejectedByStrategy {
        strategy: MigrationStrategy,
        target: MigrationMode,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    Success {
        from: MigrationMode,
        to: MigrationMode,
        rollback_count: u32,
    },
    RejectedFromExclusive,
    RejectedNothingToRollBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EmergencyOutcome {
    Activated { from: MigrationMode },
    AlreadyActive { mode: MigrationMode },
    RejectedUnconfirmed,
    RejectedIrreversible,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PredictionSummary {
    pub pending: usize,
    pub correct: usize,
    pub incorrect: usize,
    /// correct / (correct + incorrect); `None` before anything was judged
    pub accuracy_percent: Option<f64>,
}

/// Audit entry as shown to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub actor: String,
    pub action: coex_core::AuditAction,
    pub detail: String,
    pub hash: String,
}

impl From<&AuditEntry> for AuditRecord {
    fn from(entry: &AuditEntry) -> Self {
        Self {
            sequence: entry.sequence,
            recorded_at: entry.recorded_at,
            actor: entry.actor.clone(),
            action: entry.action.clone(),
            detail: entry.detail.clone(),
            hash: entry.hash_hex(),
        }
    }
}

pub struct ControlPlane {
    ctx: EngineContext,
    engine: MigrationEngine,
    readiness: ReadinessEvaluator,
}

impl ControlPlane {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            engine: MigrationEngine::new(ctx.clone()),
            readiness: ReadinessEvaluator::new(ctx.clone()),
            ctx,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &MigrationEngine {
        &self.engine
    }

    pub async fn get_status(&self, community: &CommunityId) -> Result<CommunityStatus, CoexError> {
        let store = &self.ctx.store;
        let state = store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?;
        let profile = store.load_profile(community).await?;
        let divergence_count = store
            .list_divergences(community, None)
            .await?
            .iter()
            .filter(|d| d.is_unresolved())
            .count();
        let next = match state.mode() {
            MigrationMode::Shadow => Some(MigrationMode::Parallel),
            MigrationMode::Parallel => Some(MigrationMode::Primary),
            MigrationMode::Primary => Some(MigrationMode::Exclusive),
            MigrationMode::Exclusive => None,
        };
        let readiness = match next {
            Some(target) => Some(self.readiness.check_state(&state, target).await?),
            None => None,
        };

        Ok(CommunityStatus {
            community_id: community.clone(),
            mode: state.mode(),
            strategy: state.strategy,
            incumbent_provider: profile.as_ref().map(|p| p.provider.clone()),
            incumbent_health: profile.map_or(HealthStatus::Unknown, |p| p.health_status),
            shadow_accuracy: state.accuracy_percent,
            divergence_count,
            readiness,
            rollback_count: state.rollback_count,
            rollout_percent: state.rollout_percent,
            last_shadow_sync_at: state.last_shadow_sync_at,
        })
    }

    pub async fn request_mode_change(
        &self,
        community: &CommunityId,
        target: MigrationMode,
        strategy: MigrationStrategy,
        confirmation: Option<&str>,
        operator: &str,
    ) -> Result<ModeChangeOutcome, CoexError> {
        let state = self
            .ctx
            .store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?;
        let from = state.mode();
        let plan = match strategy::plan(from, state.strategy, strategy, target, &self.ctx.config.rollout) {
            Ok(plan) => plan,
            Err(PlanRejection::Irreversible) => return Ok(ModeChangeOutcome::RejectedIrreversible),
            Err(PlanRejection::InvalidTransition { from, to }) => {
                return Ok(ModeChangeOutcome::RejectedInvalidTransition { from, to })
            }
            Err(PlanRejection::ByStrategy { strategy, target }) => {
                return Ok(ModeChangeOutcome::RejectedByStrategy { strategy, target })
            }
        };
        info!(community = %community, %target, %strategy, steps = plan.steps.len(), operator, "mode change requested");

        let outcomes = match self.engine.execute(community, &plan, confirmation, operator).await {
            Ok(outcomes) => outcomes,
            Err(CoexError::IrreversibleState { .. }) => return Ok(ModeChangeOutcome::RejectedIrreversible),
            Err(CoexError::Transition(TransitionError::Illegal { from, to })) => {
                return Ok(ModeChangeOutcome::RejectedInvalidTransition { from, to })
            }
            Err(e) => return Err(e),
        };

        let mut reached = None;
        for outcome in outcomes {
            match outcome {
                StepOutcome::Applied { to, .. } => reached = Some(to),
                StepOutcome::NotReady(report) => {
                    return Ok(match reached {
                        Some(reached) => ModeChangeOutcome::Partial {
                            reached,
                            blocked: report,
                        },
                        None => ModeChangeOutcome::RejectedNotReady(report),
                    });
                }
                StepOutcome::ConfirmationRejected => {
                    return Ok(ModeChangeOutcome::RejectedConfirmation)
                }
                StepOutcome::Unchanged { mode } => {
                    return Ok(ModeChangeOutcome::RejectedInvalidTransition { from: mode, to: target })
                }
            }
        }
        Ok(ModeChangeOutcome::Success {
            from,
            to: reached.unwrap_or(from),
        })
    }

    pub async fn rollback(
        &self,
        community: &CommunityId,
        reason: &str,
        operator: &str,
    ) -> Result<RollbackOutcome, CoexError> {
        match self.engine.rollback(community, reason, operator, false).await {
            Ok(applied) => Ok(RollbackOutcome::Success {
                from: applied.from,
                to: applied.to,
                rollback_count: applied.rollback_count,
            }),
            Err(CoexError::IrreversibleState { .. }) => Ok(RollbackOutcome::RejectedFromExclusive),
            Err(CoexError::Transition(_)) => Ok(RollbackOutcome::RejectedNothingToRollBack),
            Err(e) => Err(e),
        }
    }

    /// Divergences detected at or after `since`
    pub async fn list_divergences(
        &self,
        community: &CommunityId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Divergence>, CoexError> {
        Ok(self.ctx.store.list_divergences(community, since).await?)
    }

    pub async fn trigger_emergency_backup(
        &self,
        community: &CommunityId,
        operator: &str,
        confirmed: bool,
    ) -> Result<EmergencyOutcome, CoexError> {
        match self.engine.emergency_backup(community, operator, confirmed).await {
            Ok(StepOutcome::Applied { from, .. }) => Ok(EmergencyOutcome::Activated { from }),
            Ok(StepOutcome::Unchanged { mode }) => Ok(EmergencyOutcome::AlreadyActive { mode }),
            Ok(StepOutcome::ConfirmationRejected | StepOutcome::NotReady(_)) => {
                Ok(EmergencyOutcome::RejectedUnconfirmed)
            }
            Err(CoexError::IrreversibleState { .. }) => Ok(EmergencyOutcome::RejectedIrreversible),
            Err(e) => Err(e),
        }
    }

    /// Full audit chain, verified
    pub async fn audit_trail(&self, community: &CommunityId) -> Result<Vec<AuditRecord>, CoexError> {
        let chain = self.ctx.store.audit_log(community).await?;
        coex_core::verify_chain(&chain)?;
        Ok(chain.iter().map(AuditRecord::from).collect())
    }

    pub async fn prediction_summary(&self, community: &CommunityId) -> Result<PredictionSummary, CoexError> {
        let predictions = self.ctx.store.list_predictions(community, None).await?;
        let count = |o: PredictionOutcome| predictions.iter().filter(|p| p.outcome == o).count();
        let correct = count(PredictionOutcome::Correct);
        let incorrect = count(PredictionOutcome::Incorrect);
        #[allow(clippy::cast_precision_loss)]
        let accuracy_percent =
            (correct + incorrect > 0).then(|| correct as f64 / (correct + incorrect) as f64 * 100.0);
        Ok(PredictionSummary {
            pending: count(PredictionOutcome::Pending),
            correct,
            incorrect,
            accuracy_percent,
        })
    }
}
