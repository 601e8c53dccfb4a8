//! Rollback watcher
//!
//! Reads the access samples written by the namespaced grant manager and rolls
//! the community back one step when members are losing access, or grant
//! operations are failing, faster than the configured thresholds allow.

use crate::context::EngineContext;
use crate::migration::{MigrationEngine, RollbackApplied, SYSTEM_ACTOR};
use chrono::Duration;
use coex_core::{
    AccessSample, AlertAction, AlertSeverity, AuditAction, CoexError, CommunityId, MigrationMode,
    OperatorAlert,
};
use serde::Serialize;
use tracing::{error, info, warn};

/// Aggregated rates over the window, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccessRates {
    pub access_loss_percent: f64,
    pub error_rate_percent: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WatchOutcome {
    /// Not in PARALLEL or PRIMARY
    Inactive { mode: MigrationMode },
    NoSamples,
    Healthy(AccessRates),
    RolledBack {
        rates: AccessRates,
        reason: String,
        rollback: RollbackApplied,
    },
    /// Breach seen in `observed`, but the community had moved on by the
    /// time the rollback took the lock
    Superseded {
        observed: MigrationMode,
        current: MigrationMode,
    },
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Sum the samples into loss and error rates
#[must_use]
pub fn rates(samples: &[AccessSample]) -> AccessRates {
    let with_access: u64 = samples.iter().map(|s| s.members_with_access).sum();
    let lost: u64 = samples.iter().map(|s| s.members_lost_access).sum();
    let errors: u64 = samples.iter().map(|s| s.operation_errors).sum();
    let operations: u64 = samples.iter().map(|s| s.operations).sum();
    AccessRates {
        access_loss_percent: percent(lost, with_access),
        error_rate_percent: percent(errors, operations),
        samples: samples.len(),
    }
}

pub struct RollbackWatcher {
    ctx: EngineContext,
    engine: MigrationEngine,
}

impl RollbackWatcher {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            engine: MigrationEngine::new(ctx.clone()),
            ctx,
        }
    }

    /// Evaluate the trailing window and roll back on breach
    ///
    /// # Errors
    /// When a breach is found but the rollback cannot be persisted, a critical
    /// alert goes out and the rollback error is returned.
    pub async fn evaluate(&self, community: &CommunityId) -> Result<WatchOutcome, CoexError> {
        let state = self
            .ctx
            .store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?;
        if !state.mode().allows_namespaced_mutation() {
            return Ok(WatchOutcome::Inactive { mode: state.mode() });
        }

        let watcher = self.ctx.config.watcher;
        let now = self.ctx.now();
        let mut since = now - Duration::minutes(i64::from(watcher.window_minutes));
        // Samples from before the last rollback describe a mode we already left.
        if let Some(last) = state.last_rollback_at {
            since = since.max(last);
        }
        let samples = self.ctx.store.access_samples_since(community, since).await?;
        if samples.is_empty() {
            return Ok(WatchOutcome::NoSamples);
        }

        let rates = rates(&samples);
        let breach = if rates.access_loss_percent > watcher.max_access_loss_percent {
            Some(format!(
                "access loss {:.1}% exceeds {:.1}% threshold",
                rates.access_loss_percent, watcher.max_access_loss_percent
            ))
        } else if rates.error_rate_percent > watcher.max_error_rate_percent {
            Some(format!(
                "grant operation error rate {:.1}% exceeds {:.1}% threshold",
                rates.error_rate_percent, watcher.max_error_rate_percent
            ))
        } else {
            None
        };

        let Some(reason) = breach else {
            info!(
                community = %community,
                loss = rates.access_loss_percent,
                errors = rates.error_rate_percent,
                "rollback watcher: within thresholds"
            );
            return Ok(WatchOutcome::Healthy(rates));
        };

        let observed = state.mode();
        warn!(community = %community, %reason, mode = %observed, "rollback watcher breach");
        match self.engine.rollback_from(community, observed, &reason).await {
            Ok(rollback) => Ok(WatchOutcome::RolledBack {
                rates,
                reason,
                rollback,
            }),
            Err(CoexError::StaleMode { actual, .. }) => {
                info!(community = %community, %observed, current = %actual, "mode changed since breach; no rollback");
                Ok(WatchOutcome::Superseded {
                    observed,
                    current: actual,
                })
            }
            Err(e) => {
                error!(community = %community, error = %e, "automatic rollback failed; escalating");
                self.escalate(community, &reason, &e).await;
                Err(e)
            }
        }
    }

    async fn escalate(&self, community: &CommunityId, reason: &str, cause: &CoexError) {
        let alert = OperatorAlert {
            community_id: community.clone(),
            severity: AlertSeverity::Critical,
            title: "Automatic rollback failed".to_string(),
            message: format!("{reason}; rollback error: {cause}"),
            actions: vec![AlertAction::Acknowledge],
            raised_at: self.ctx.now(),
        };
        if let Err(e) = self.ctx.alerts.send(alert).await {
            error!(community = %community, error = %e, "escalation alert not delivered");
        }
        if let Err(e) = self
            .engine
            .append_audit(community, SYSTEM_ACTOR, AuditAction::RollbackEscalated, reason)
            .await
        {
            error!(community = %community, error = %e, "escalation not audited");
        }
    }
}
