//! Strategy dispatch
//!
//! A mode-change request is turned into a [`TransitionPlan`] once; the engine
//! then executes the plan's steps in order, each one readiness-gated.

use coex_core::{MigrationMode, MigrationStrategy, RolloutConfig};
use serde::Serialize;

/// One engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStep {
    EnableParallel,
    SetPrimary,
    Takeover,
}

impl PlanStep {
    #[must_use]
    pub fn target(&self) -> MigrationMode {
        match self {
            PlanStep::EnableParallel => MigrationMode::Parallel,
            PlanStep::SetPrimary => MigrationMode::Primary,
            PlanStep::Takeover => MigrationMode::Exclusive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionPlan {
    pub strategy: MigrationStrategy,
    pub target: MigrationMode,
    pub steps: Vec<PlanStep>,
    /// Rollout to start the parallel grant manager with
    pub initial_rollout_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanRejection {
    #[error("EXCLUSIVE is irreversible")]
    Irreversible,

    #[error("no transition from {from} to {to}")]
    InvalidTransition {
        from: MigrationMode,
        to: MigrationMode,
    },

    #[error("strategy {strategy} does not allow {target}")]
    ByStrategy {
        strategy: MigrationStrategy,
        target: MigrationMode,
    },
}

fn single_step(from: MigrationMode, to: MigrationMode) -> Option<PlanStep> {
    match (from, to) {
        (MigrationMode::Shadow, MigrationMode::Parallel) => Some(PlanStep::EnableParallel),
        (MigrationMode::Parallel, MigrationMode::Primary) => Some(PlanStep::SetPrimary),
        (MigrationMode::Primary | MigrationMode::Shadow, MigrationMode::Exclusive) => {
            Some(PlanStep::Takeover)
        }
        _ => None,
    }
}

/// Build the plan for moving from `current` to `target`
///
/// `recorded` is the strategy already stored on the community; a recorded
/// PARALLEL_FOREVER pins the community to PARALLEL whatever is requested.
pub fn plan(
    current: MigrationMode,
    recorded: Option<MigrationStrategy>,
    requested: MigrationStrategy,
    target: MigrationMode,
    rollout: &RolloutConfig,
) -> Result<TransitionPlan, PlanRejection> {
    if current.is_terminal() {
        return Err(PlanRejection::Irreversible);
    }
    for strategy in [recorded, Some(requested)].into_iter().flatten() {
        if strategy == MigrationStrategy::ParallelForever && target != MigrationMode::Parallel {
            return Err(PlanRejection::ByStrategy { strategy, target });
        }
    }

    let steps = match (requested, current, target) {
        (MigrationStrategy::NewSystemPrimary, MigrationMode::Shadow, MigrationMode::Primary) => {
            vec![PlanStep::EnableParallel, PlanStep::SetPrimary]
        }
        _ => vec![single_step(current, target).ok_or(PlanRejection::InvalidTransition {
            from: current,
            to: target,
        })?],
    };

    let initial_rollout_percent = match requested {
        MigrationStrategy::Gradual => rollout.gradual_initial_percent.min(100),
        MigrationStrategy::Instant
        | MigrationStrategy::ParallelForever
        | MigrationStrategy::NewSystemPrimary => 100,
    };

    Ok(TransitionPlan {
        strategy: requested,
        target,
        steps,
        initial_rollout_percent,
    })
}
