use crate::types::MigrationMode;

/// Why a mode change is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// Normal one-step escalation
    Escalate,
    /// Operator-confirmed direct takeover, skipping PARALLEL/PRIMARY
    OperatorOverride,
    /// One step back
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        from: MigrationMode,
        to: MigrationMode,
    },

    #[error("{from} is irreversible")]
    Irreversible { from: MigrationMode },
}

/// Validates a mode transition.
///
/// EXCLUSIVE is terminal: any attempt to leave it reports `Irreversible`
/// rather than `Illegal` so callers can surface the stronger error.
pub fn validate_transition(
    from: MigrationMode,
    to: MigrationMode,
    kind: TransitionKind,
) -> Result<(), TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError::Irreversible { from });
    }
    if allowed(from, to, kind) {
        Ok(())
    } else {
        Err(TransitionError::Illegal { from, to })
    }
}

pub fn allowed_transitions(from: MigrationMode, kind: TransitionKind) -> Vec<MigrationMode> {
    use MigrationMode::*;
    match (kind, from) {
        (TransitionKind::Escalate, Shadow) => vec![Parallel],
        (TransitionKind::Escalate, Parallel) => vec![Primary],
        (TransitionKind::Escalate, Primary) => vec![Exclusive],
        (TransitionKind::OperatorOverride, Shadow) => vec![Exclusive],
        (TransitionKind::OperatorOverride, Primary) => vec![Exclusive],
        (TransitionKind::Rollback, Parallel) => vec![Shadow],
        (TransitionKind::Rollback, Primary) => vec![Parallel],
        _ => vec![],
    }
}

fn allowed(from: MigrationMode, to: MigrationMode, kind: TransitionKind) -> bool {
    allowed_transitions(from, kind).into_iter().any(|m| m == to)
}
