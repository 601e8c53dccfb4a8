//! Shadow ledger
//!
//! Compares what the incumbent grants with what the new system would grant,
//! member by member, and keeps divergence and prediction history. The ledger
//! only holds the read half of the platform client, so it cannot mutate the
//! community.

use crate::context::EngineContext;
use crate::readiness;
use crate::telemetry;
use crate::tiers::tier_for;
use chrono::{DateTime, Duration, Utc};
use coex_core::{
    CoexError, CommunityId, Divergence, DivergenceKind, DivergenceResolution, DivergenceStatus,
    GrantId, InvariantViolation, MemberId, MigrationMode, Prediction, PredictionOutcome,
    PredictionType, ShadowMemberRecord,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Summary of one committed sync
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub community_id: CommunityId,
    pub processed: usize,
    pub failed: usize,
    pub unknown: usize,
    pub matches: usize,
    pub divergent: usize,
    pub divergences_opened: usize,
    pub divergences_resolved: usize,
    pub predictions_opened: usize,
    pub predictions_confirmed: usize,
    pub predictions_expired: usize,
    pub accuracy_percent: f64,
    pub readiness_passed: bool,
    pub completed_at: DateTime<Utc>,
}

/// Classify one linked member
#[must_use]
pub fn classify(has_incumbent_access: bool, would_grant: bool) -> DivergenceStatus {
    match (has_incumbent_access, would_grant) {
        (false, true) => DivergenceStatus::NewSystemHigher,
        (true, false) => DivergenceStatus::NewSystemLower,
        _ => DivergenceStatus::Match,
    }
}

/// matches / (matches + divergences) as a percentage; 0 with no known members
#[must_use]
pub fn accuracy(matches: usize, divergent: usize) -> f64 {
    let known = matches + divergent;
    if known == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let pct = matches as f64 / known as f64 * 100.0;
    pct
}

/// Read-only inputs shared by every member of one sync
struct SyncView {
    community: CommunityId,
    mode: MigrationMode,
    access_grants: BTreeSet<String>,
    grant_names: BTreeMap<GrantId, String>,
    now: DateTime<Utc>,
}

impl SyncView {
    fn access_of(&self, grants: &BTreeSet<String>) -> BTreeSet<String> {
        grants.intersection(&self.access_grants).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct MemberOutcome {
    status: Option<DivergenceStatus>,
    opened: usize,
    resolved: usize,
    predictions_opened: usize,
    predictions_confirmed: usize,
}

pub struct ShadowLedger {
    ctx: EngineContext,
}

impl ShadowLedger {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Run one comparison pass over every member of `community`
    ///
    /// # Errors
    /// `InvariantViolation` outside SHADOW; `SyncIncomplete` when more members
    /// failed than the configured ratio allows, in which case the accuracy
    /// snapshot is not written.
    pub async fn sync(&self, community: &CommunityId) -> Result<SyncReport, CoexError> {
        let store = &self.ctx.store;
        let lock = store.lock_community(community).await?;
        let mut state = store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?;
        if state.mode() != MigrationMode::Shadow {
            error!(community = %community, mode = ?state.mode(), "shadow sync outside SHADOW");
            return Err(InvariantViolation::ShadowOutsideShadowMode {
                community: community.clone(),
                mode: state.mode(),
            }
            .into());
        }

        let shadow = self.ctx.config.shadow;
        let access_grants = store
            .load_profile(community)
            .await?
            .map(|p| {
                p.access_grants(shadow.access_grant_min_confidence)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let grant_names = self
            .ctx
            .reader
            .list_grants(community)
            .await?
            .into_iter()
            .map(|g| (g.id, g.name))
            .collect();
        let members = self.ctx.reader.list_members(community).await?;
        let mut pending: BTreeMap<MemberId, Vec<Prediction>> = BTreeMap::new();
        for p in store
            .list_predictions(community, Some(PredictionOutcome::Pending))
            .await?
        {
            pending.entry(p.member_id.clone()).or_default().push(p);
        }

        let view = SyncView {
            community: community.clone(),
            mode: state.mode(),
            access_grants,
            grant_names,
            now: self.ctx.now(),
        };
        let view = &view;
        let timeout = shadow.member_timeout();
        let total = members.len();

        let results: Vec<(MemberId, Result<MemberOutcome, CoexError>)> = stream::iter(members)
            .map(|member| {
                let pending = pending.remove(&member).unwrap_or_default();
                async move {
                    let result = tokio::time::timeout(timeout, self.sync_member(view, &member, pending))
                        .await
                        .unwrap_or(Err(CoexError::Timeout {
                            duration_secs: timeout.as_secs(),
                        }));
                    (member, result)
                }
            })
            .buffer_unordered(shadow.concurrency)
            .collect()
            .await;

        let mut report = SyncReport {
            community_id: community.clone(),
            processed: 0,
            failed: 0,
            unknown: 0,
            matches: 0,
            divergent: 0,
            divergences_opened: 0,
            divergences_resolved: 0,
            predictions_opened: 0,
            predictions_confirmed: 0,
            predictions_expired: 0,
            accuracy_percent: 0.0,
            readiness_passed: false,
            completed_at: view.now,
        };
        for (member, result) in results {
            match result {
                Ok(outcome) => {
                    report.processed += 1;
                    match outcome.status {
                        Some(DivergenceStatus::Match) => report.matches += 1,
                        Some(DivergenceStatus::Unknown) | None => report.unknown += 1,
                        Some(_) => report.divergent += 1,
                    }
                    report.divergences_opened += outcome.opened;
                    report.divergences_resolved += outcome.resolved;
                    report.predictions_opened += outcome.predictions_opened;
                    report.predictions_confirmed += outcome.predictions_confirmed;
                }
                Err(e) if e.is_invariant_violation() => return Err(e),
                Err(e) => {
                    warn!(community = %community, member = %member, error = %e, "member comparison failed");
                    report.failed += 1;
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let failure_ratio = if total == 0 {
            0.0
        } else {
            report.failed as f64 / total as f64
        };
        if failure_ratio > shadow.max_member_failure_ratio {
            telemetry::record_shadow_sync(community, "incomplete");
            warn!(
                community = %community,
                failed = report.failed,
                total,
                "shadow sync discarded; too many member failures"
            );
            return Err(CoexError::SyncIncomplete {
                community: community.clone(),
                failed: report.failed,
                total,
            });
        }

        report.predictions_expired = self.expire_predictions(view).await?;
        report.accuracy_percent = accuracy(report.matches, report.divergent);

        state.accuracy_percent = report.accuracy_percent;
        state.last_shadow_sync_at = Some(view.now);
        state.updated_at = view.now;
        let thresholds = self.ctx.config.readiness.for_target(MigrationMode::Parallel);
        let since = view.now - Duration::hours(i64::from(thresholds.divergence_window_hours));
        let recent = store.list_divergences(community, Some(since)).await?;
        report.readiness_passed =
            readiness::evaluate(&state, MigrationMode::Parallel, thresholds, &recent, view.now).passed();
        state.readiness_check_passed = report.readiness_passed;
        store.save_state(&state, &lock).await?;

        telemetry::record_shadow_sync(community, "committed");
        telemetry::record_divergences(community, report.divergences_opened);
        telemetry::record_accuracy(community, report.accuracy_percent);
        info!(
            community = %community,
            processed = report.processed,
            failed = report.failed,
            unknown = report.unknown,
            divergent = report.divergent,
            accuracy = report.accuracy_percent,
            "shadow sync committed"
        );
        Ok(report)
    }

    async fn sync_member(
        &self,
        view: &SyncView,
        member: &MemberId,
        pending: Vec<Prediction>,
    ) -> Result<MemberOutcome, CoexError> {
        let community = &view.community;
        let incumbent_grants: BTreeSet<String> = self
            .ctx
            .reader
            .get_member_grants(community, member)
            .await?
            .into_iter()
            .map(|id| view.grant_names.get(&id).cloned().unwrap_or(id.0))
            .collect();
        let prior = self.ctx.store.load_member_record(community, member).await?;

        let record = match self.ctx.identities.linked_identity(community, member).await? {
            None => ShadowMemberRecord::unlinked(
                community.clone(),
                member.clone(),
                incumbent_grants,
                view.now,
            ),
            Some(identity) => {
                let eligibility = self.ctx.eligibility.evaluate(&identity).await?;
                let access = view.access_of(&incumbent_grants);
                let status = classify(!access.is_empty(), eligibility.tier.is_some());
                let namespace = &self.ctx.config.namespace;
                let would_grant = eligibility
                    .tier
                    .iter()
                    .map(|tier| namespace.grant_name(tier))
                    .collect();
                let would_revoke = if eligibility.tier.is_some() {
                    BTreeSet::new()
                } else {
                    access
                };
                ShadowMemberRecord {
                    community_id: community.clone(),
                    member_id: member.clone(),
                    incumbent_grants,
                    linked_identity: Some(identity),
                    computed_eligibility: eligibility.tier,
                    computed_score: Some(eligibility.score),
                    would_grant,
                    would_revoke,
                    divergence_status: status,
                    verification_tier: tier_for(view.mode, true),
                    updated_at: view.now,
                }
            }
        };
        self.ctx.store.upsert_member_record(&record).await?;

        let mut outcome = MemberOutcome {
            status: Some(record.divergence_status),
            ..MemberOutcome::default()
        };
        let status_changed = prior
            .as_ref()
            .map_or(true, |p| p.divergence_status != record.divergence_status);
        let incumbent_changed = prior.as_ref().is_some_and(|p| {
            view.access_of(&p.incumbent_grants) != view.access_of(&record.incumbent_grants)
        });

        if status_changed {
            self.reconcile_divergences(view, &record, incumbent_changed, &mut outcome)
                .await?;
        }
        self.reconcile_predictions(view, prior.as_ref(), &record, incumbent_changed, pending, &mut outcome)
            .await?;
        Ok(outcome)
    }

    async fn reconcile_divergences(
        &self,
        view: &SyncView,
        record: &ShadowMemberRecord,
        incumbent_changed: bool,
        outcome: &mut MemberOutcome,
    ) -> Result<(), CoexError> {
        let store = &self.ctx.store;
        let status = record.divergence_status;
        if status == DivergenceStatus::Unknown {
            return Ok(());
        }
        let open = store
            .open_divergences(&view.community, &record.member_id)
            .await?;

        match DivergenceKind::from_status(status) {
            Some(kind) => {
                for stale in open.iter().filter(|d| d.kind != kind) {
                    store
                        .resolve_divergence(
                            &view.community,
                            stale.id,
                            DivergenceResolution::StillDivergent,
                            view.now,
                        )
                        .await?;
                    outcome.resolved += 1;
                }
                if !open.iter().any(|d| d.kind == kind) {
                    let divergence = Divergence {
                        id: Ulid::new(),
                        community_id: view.community.clone(),
                        member_id: record.member_id.clone(),
                        kind,
                        incumbent_state: view.access_of(&record.incumbent_grants),
                        new_system_state: record.computed_eligibility.clone(),
                        detected_at: view.now,
                        resolved_at: None,
                        resolution: None,
                    };
                    store.append_divergence(&divergence).await?;
                    outcome.opened += 1;
                    debug!(community = %view.community, member = %record.member_id, ?kind, "divergence opened");
                }
            }
            None => {
                let resolution = if incumbent_changed {
                    DivergenceResolution::IncumbentMatched
                } else {
                    DivergenceResolution::NewSystemWrong
                };
                for d in &open {
                    store
                        .resolve_divergence(&view.community, d.id, resolution, view.now)
                        .await?;
                    outcome.resolved += 1;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_predictions(
        &self,
        view: &SyncView,
        prior: Option<&ShadowMemberRecord>,
        record: &ShadowMemberRecord,
        incumbent_changed: bool,
        pending: Vec<Prediction>,
        outcome: &mut MemberOutcome,
    ) -> Result<(), CoexError> {
        let store = &self.ctx.store;
        let expected = match record.divergence_status {
            DivergenceStatus::NewSystemHigher => Some(PredictionType::IncumbentWillGrant),
            DivergenceStatus::NewSystemLower => Some(PredictionType::IncumbentWillRevoke),
            DivergenceStatus::Match | DivergenceStatus::Unknown => None,
        };

        if let Some(prediction_type) = expected {
            if !pending.iter().any(|p| p.prediction_type == prediction_type) {
                let details = match prediction_type {
                    PredictionType::IncumbentWillGrant => format!(
                        "new system computes {}; incumbent grants no access",
                        record.computed_eligibility.as_deref().unwrap_or("a tier")
                    ),
                    PredictionType::IncumbentWillRevoke => format!(
                        "incumbent access {:?}; new system computes no tier",
                        view.access_of(&record.incumbent_grants)
                    ),
                };
                let prediction = Prediction {
                    id: Ulid::new(),
                    community_id: view.community.clone(),
                    member_id: record.member_id.clone(),
                    prediction_type,
                    predicted_at: view.now,
                    details,
                    outcome: PredictionOutcome::Pending,
                    outcome_at: None,
                };
                store.save_prediction(&prediction).await?;
                outcome.predictions_opened += 1;
            }
            return Ok(());
        }

        // Incumbent caught up with the new system: the matching prediction came true.
        let came_true = match prior.map(|p| p.divergence_status) {
            Some(DivergenceStatus::NewSystemHigher) => Some(PredictionType::IncumbentWillGrant),
            Some(DivergenceStatus::NewSystemLower) => Some(PredictionType::IncumbentWillRevoke),
            _ => None,
        };
        if record.divergence_status == DivergenceStatus::Match && incumbent_changed {
            if let Some(prediction_type) = came_true {
                for mut p in pending
                    .into_iter()
                    .filter(|p| p.prediction_type == prediction_type)
                {
                    p.outcome = PredictionOutcome::Correct;
                    p.outcome_at = Some(view.now);
                    store.save_prediction(&p).await?;
                    outcome.predictions_confirmed += 1;
                }
            }
        }
        Ok(())
    }

    async fn expire_predictions(&self, view: &SyncView) -> Result<usize, CoexError> {
        let window = Duration::hours(i64::from(self.ctx.config.shadow.prediction_window_hours));
        let cutoff = view.now - window;
        let mut expired = 0;
        for mut p in self
            .ctx
            .store
            .list_predictions(&view.community, Some(PredictionOutcome::Pending))
            .await?
            .into_iter()
            .filter(|p| p.predicted_at < cutoff)
        {
            p.outcome = PredictionOutcome::Incorrect;
            p.outcome_at = Some(view.now);
            self.ctx.store.save_prediction(&p).await?;
            expired += 1;
        }
        Ok(expired)
    }
}
