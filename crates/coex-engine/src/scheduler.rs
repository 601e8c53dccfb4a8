//! Job runner and schedule
//!
//! Jobs are independent, idempotent, per-community tasks. The runner keeps no
//! state between runs: an external trigger asks [`JobSchedule::due`] which
//! jobs to start and hands them to [`JobRunner::run`]. Each attempt has a hard
//! wall-clock timeout; transient failures are retried with bounded
//! exponential backoff.

use crate::context::EngineContext;
use crate::grants::{GrantSyncReport, NamespacedGrantManager};
use crate::health::{HealthMonitor, HealthReport};
use crate::ledger::{ShadowLedger, SyncReport};
use crate::telemetry;
use crate::watcher::{RollbackWatcher, WatchOutcome};
use chrono::{DateTime, Duration, Utc};
use coex_core::{CoexError, CommunityId, JobConfig, MigrationMode};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ShadowSync,
    ParallelSync,
    HealthCheck,
    RollbackWatch,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ShadowSync,
        JobKind::ParallelSync,
        JobKind::HealthCheck,
        JobKind::RollbackWatch,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ShadowSync => "shadow_sync",
            JobKind::ParallelSync => "parallel_sync",
            JobKind::HealthCheck => "health_check",
            JobKind::RollbackWatch => "rollback_watch",
        }
    }

    /// Whether the job has anything to do in `mode`
    #[must_use]
    pub fn applies_to(&self, mode: MigrationMode) -> bool {
        match self {
            JobKind::ShadowSync => mode == MigrationMode::Shadow,
            JobKind::ParallelSync | JobKind::RollbackWatch => mode.allows_namespaced_mutation(),
            JobKind::HealthCheck => true,
        }
    }

    #[must_use]
    pub fn interval(&self, config: &JobConfig) -> Duration {
        let mins = match self {
            JobKind::ShadowSync => config.shadow_sync_interval_mins,
            JobKind::ParallelSync => config.parallel_sync_interval_mins,
            JobKind::HealthCheck => config.health_check_interval_mins,
            JobKind::RollbackWatch => config.rollback_watch_interval_mins,
        };
        Duration::minutes(i64::try_from(mins).unwrap_or(i64::MAX / 60_000))
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job that exhausted its attempts or hit a non-retryable error
#[derive(Debug, thiserror::Error)]
#[error("{kind} job for {community} failed after {attempts} attempt(s): {source}")]
pub struct JobFailure {
    pub community: CommunityId,
    pub kind: JobKind,
    pub attempts: u32,
    #[source]
    pub source: CoexError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    ShadowSync(SyncReport),
    ParallelSync(GrantSyncReport),
    HealthCheck(HealthReport),
    RollbackWatch(WatchOutcome),
    /// Job does not apply to the community's current mode
    Skipped { mode: MigrationMode },
}

/// Due-ness calculator for an external trigger
#[derive(Debug, Clone, Copy)]
pub struct JobSchedule {
    config: JobConfig,
}

impl JobSchedule {
    #[must_use]
    pub fn new(config: JobConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn due(
        &self,
        kind: JobKind,
        mode: MigrationMode,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        kind.applies_to(mode) && last_run.map_or(true, |last| now - last >= kind.interval(&self.config))
    }

    /// Jobs due for a community given when each last ran
    #[must_use]
    pub fn due_jobs(
        &self,
        mode: MigrationMode,
        last_runs: &BTreeMap<JobKind, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| self.due(*kind, mode, last_runs.get(kind).copied(), now))
            .collect()
    }
}

pub struct JobRunner {
    ctx: EngineContext,
    ledger: ShadowLedger,
    grants: NamespacedGrantManager,
    health: HealthMonitor,
    watcher: RollbackWatcher,
}

impl JobRunner {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ledger: ShadowLedger::new(ctx.clone()),
            grants: NamespacedGrantManager::new(ctx.clone()),
            health: HealthMonitor::new(ctx.clone()),
            watcher: RollbackWatcher::new(ctx.clone()),
            ctx,
        }
    }

    #[must_use]
    pub fn schedule(&self) -> JobSchedule {
        JobSchedule::new(self.ctx.config.jobs)
    }

    /// Run one job with timeout and retry
    pub async fn run(&self, community: &CommunityId, kind: JobKind) -> Result<JobReport, JobFailure> {
        let jobs = self.ctx.config.jobs;
        let max_attempts = jobs.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(jobs.timeout(), self.attempt(community, kind)).await {
                Ok(result) => result,
                Err(_) => Err(CoexError::Timeout {
                    duration_secs: jobs.timeout_secs,
                }),
            };
            match result {
                Ok(report) => {
                    debug!(community = %community, job = %kind, attempt, "job finished");
                    return Ok(report);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = jobs.retry.delay_for(attempt);
                    warn!(community = %community, job = %kind, attempt, ?delay, error = %e, "job attempt failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    telemetry::record_job_failure(kind.as_str());
                    if e.is_invariant_violation() {
                        error!(community = %community, job = %kind, error = %e, "job hit invariant violation");
                    } else {
                        warn!(community = %community, job = %kind, attempts = attempt, error = %e, "job failed");
                    }
                    return Err(JobFailure {
                        community: community.clone(),
                        kind,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Run every due job for a community, in [`JobKind::ALL`] order
    pub async fn run_due(
        &self,
        community: &CommunityId,
        last_runs: &BTreeMap<JobKind, DateTime<Utc>>,
    ) -> Result<Vec<(JobKind, Result<JobReport, JobFailure>)>, CoexError> {
        let mode = self
            .ctx
            .store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?
            .mode();
        let due = self.schedule().due_jobs(mode, last_runs, self.ctx.now());
        let mut results = Vec::with_capacity(due.len());
        for kind in due {
            results.push((kind, self.run(community, kind).await));
        }
        Ok(results)
    }

    async fn attempt(&self, community: &CommunityId, kind: JobKind) -> Result<JobReport, CoexError> {
        let mode = self
            .ctx
            .store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?
            .mode();
        if !kind.applies_to(mode) {
            return Ok(JobReport::Skipped { mode });
        }
        Ok(match kind {
            JobKind::ShadowSync => JobReport::ShadowSync(self.ledger.sync(community).await?),
            JobKind::ParallelSync => JobReport::ParallelSync(self.grants.sync(community).await?),
            JobKind::HealthCheck => JobReport::HealthCheck(self.health.check(community).await?),
            JobKind::RollbackWatch => {
                JobReport::RollbackWatch(self.watcher.evaluate(community).await?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coex_test_utils::t0;

    #[test]
    fn shadow_sync_only_due_in_shadow() {
        let schedule = JobSchedule::new(JobConfig::default());
        assert!(schedule.due(JobKind::ShadowSync, MigrationMode::Shadow, None, t0()));
        assert!(!schedule.due(JobKind::ShadowSync, MigrationMode::Parallel, None, t0()));
        assert!(!schedule.due(JobKind::RollbackWatch, MigrationMode::Shadow, None, t0()));
        assert!(schedule.due(JobKind::HealthCheck, MigrationMode::Exclusive, None, t0()));
    }

    #[test]
    fn intervals_gate_reruns() {
        let schedule = JobSchedule::new(JobConfig::default());
        let last = t0();
        assert!(!schedule.due(
            JobKind::ShadowSync,
            MigrationMode::Shadow,
            Some(last),
            last + Duration::hours(5)
        ));
        assert!(schedule.due(
            JobKind::ShadowSync,
            MigrationMode::Shadow,
            Some(last),
            last + Duration::hours(6)
        ));
        assert!(schedule.due(
            JobKind::HealthCheck,
            MigrationMode::Shadow,
            Some(last),
            last + Duration::hours(1)
        ));
    }

    #[test]
    fn due_jobs_follow_mode() {
        let schedule = JobSchedule::new(JobConfig::default());
        let due = schedule.due_jobs(MigrationMode::Parallel, &BTreeMap::new(), t0());
        assert_eq!(
            due,
            vec![JobKind::ParallelSync, JobKind::HealthCheck, JobKind::RollbackWatch]
        );
    }
}
