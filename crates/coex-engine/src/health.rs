//! Incumbent health monitor
//!
//! Advisory only: findings are persisted and operators are alerted (at most
//! once per throttle window), but no transition is ever triggered from here.

use crate::context::EngineContext;
use crate::telemetry;
use chrono::{DateTime, Duration, Utc};
use coex_core::{
    AlertAction, AlertSeverity, CoexError, CommunityId, HealthCheckRecord, HealthIssue,
    HealthStatus, IncumbentProfile, IssueSeverity, OperatorAlert,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
    pub alerted: bool,
}

/// Worst severity wins
#[must_use]
pub fn aggregate(issues: &[HealthIssue]) -> HealthStatus {
    match issues.iter().map(|i| i.severity).max() {
        Some(IssueSeverity::Critical) => HealthStatus::Critical,
        Some(IssueSeverity::Warning) => HealthStatus::Warning,
        None => HealthStatus::Healthy,
    }
}

pub struct HealthMonitor {
    ctx: EngineContext,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn check(&self, community: &CommunityId) -> Result<HealthReport, CoexError> {
        let now = self.ctx.now();
        let Some(mut profile) = self.ctx.store.load_profile(community).await? else {
            let report = HealthReport {
                status: HealthStatus::Unknown,
                issues: Vec::new(),
                alerted: false,
            };
            self.persist(community, now, &report).await?;
            return Ok(report);
        };

        let issues = self.inspect(community, &profile, now).await?;
        let status = aggregate(&issues);
        let alerted = if status.is_degraded() && self.alert_due(community, now).await? {
            self.alert(community, status, &issues, now).await
        } else {
            false
        };
        let report = HealthReport {
            status,
            issues,
            alerted,
        };

        profile.health_status = status;
        profile.last_health_check_at = Some(now);
        self.ctx.store.save_profile(&profile).await?;
        self.persist(community, now, &report).await?;

        if status.is_degraded() {
            warn!(community = %community, ?status, issues = report.issues.len(), alerted, "incumbent degraded");
        } else {
            info!(community = %community, "incumbent healthy");
        }
        Ok(report)
    }

    async fn inspect(
        &self,
        community: &CommunityId,
        profile: &IncumbentProfile,
        now: DateTime<Utc>,
    ) -> Result<Vec<HealthIssue>, CoexError> {
        let health = self.ctx.config.health;
        let Some(automation_id) = &profile.automation_identity else {
            return Ok(vec![HealthIssue::warning(
                "incumbent automation not identified; liveness cannot be checked",
            )]);
        };

        let automations = self.ctx.reader.list_automations(community).await?;
        let Some(automation) = automations.iter().find(|a| &a.id == automation_id) else {
            return Ok(vec![HealthIssue::critical(format!(
                "{} automation {automation_id} is no longer present",
                profile.provider
            ))]);
        };

        let mut issues = Vec::new();
        if !automation.online {
            issues.push(HealthIssue::critical(format!(
                "{} automation {automation_id} is offline",
                profile.provider
            )));
        }

        match self
            .ctx
            .reader
            .latest_grant_activity(community, automation_id)
            .await?
        {
            None => issues.push(HealthIssue::warning("no grant activity observed")),
            Some(at) => {
                let idle = now - at;
                let hours = idle.num_hours();
                if idle >= Duration::hours(i64::from(health.critical_hours)) {
                    issues.push(HealthIssue::critical(format!(
                        "no grant activity for {hours}h (critical at {}h)",
                        health.critical_hours
                    )));
                } else if idle >= Duration::hours(i64::from(health.warning_hours)) {
                    issues.push(HealthIssue::warning(format!(
                        "no grant activity for {hours}h (warning at {}h)",
                        health.warning_hours
                    )));
                }
            }
        }
        Ok(issues)
    }

    async fn alert_due(&self, community: &CommunityId, now: DateTime<Utc>) -> Result<bool, CoexError> {
        let throttle = Duration::hours(i64::from(self.ctx.config.health.alert_throttle_hours));
        Ok(self
            .ctx
            .store
            .last_alert_at(community)
            .await?
            .map_or(true, |last| now - last >= throttle))
    }

    async fn alert(
        &self,
        community: &CommunityId,
        status: HealthStatus,
        issues: &[HealthIssue],
        now: DateTime<Utc>,
    ) -> bool {
        let severity = if status == HealthStatus::Critical {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let alert = OperatorAlert {
            community_id: community.clone(),
            severity,
            title: format!("Incumbent health {status:?}"),
            message: issues
                .iter()
                .map(|i| i.message.as_str())
                .collect::<Vec<_>>()
                .join("; "),
            actions: vec![AlertAction::ActivateBackup, AlertAction::Acknowledge],
            raised_at: now,
        };
        match self.ctx.alerts.send(alert).await {
            Ok(()) => {
                telemetry::record_health_alert(community);
                true
            }
            Err(e) => {
                warn!(community = %community, error = %e, "health alert not delivered");
                false
            }
        }
    }

    async fn persist(
        &self,
        community: &CommunityId,
        now: DateTime<Utc>,
        report: &HealthReport,
    ) -> Result<(), CoexError> {
        let record = HealthCheckRecord {
            community_id: community.clone(),
            checked_at: now,
            status: report.status,
            issues: report.issues.clone(),
            alerted: report.alerted,
        };
        self.ctx.store.record_health_check(&record).await?;
        Ok(())
    }
}
