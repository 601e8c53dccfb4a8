//! Concurrent in-memory store
//!
//! Every table is a `DashMap` keyed by community; per-community locks are
//! `tokio` mutexes handed out as owned guards. Suitable for tests, the
//! simulator and single-process deployments. Access samples and health
//! records older than the retention window are pruned on write.

use crate::lock::CommunityLock;
use crate::store::MigrationStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use coex_core::{
    AccessSample, AuditEntry, CommunityId, CommunityMigrationState, Divergence,
    DivergenceResolution, HealthCheckRecord, IncumbentProfile, MemberId, Prediction,
    PredictionOutcome, ShadowMemberRecord, StoreError,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use ulid::Ulid;

/// Default age limit for access samples and health records
const DEFAULT_RETENTION_HOURS: i64 = 24;

#[derive(Debug)]
pub struct InMemoryStore {
    retention: Duration,
    locks: DashMap<CommunityId, Arc<Mutex<()>>>,
    states: DashMap<CommunityId, CommunityMigrationState>,
    profiles: DashMap<CommunityId, IncumbentProfile>,
    members: DashMap<CommunityId, BTreeMap<MemberId, ShadowMemberRecord>>,
    divergences: DashMap<CommunityId, Vec<Divergence>>,
    predictions: DashMap<CommunityId, BTreeMap<Ulid, Prediction>>,
    health: DashMap<CommunityId, Vec<HealthCheckRecord>>,
    samples: DashMap<CommunityId, Vec<AccessSample>>,
    audit: DashMap<CommunityId, Vec<AuditEntry>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
            locks: DashMap::new(),
            states: DashMap::new(),
            profiles: DashMap::new(),
            members: DashMap::new(),
            divergences: DashMap::new(),
            predictions: DashMap::new(),
            health: DashMap::new(),
            samples: DashMap::new(),
            audit: DashMap::new(),
        }
    }
}

impl InMemoryStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a custom retention window for samples and health records
    ///
    /// Must cover the rollback watcher window and the alert throttle.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Whether someone currently holds the community lock
    #[must_use]
    pub fn is_locked(&self, community: &CommunityId) -> bool {
        self.locks
            .get(community)
            .is_some_and(|m| m.try_lock().is_err())
    }

    fn lock_handle(&self, community: &CommunityId) -> Arc<Mutex<()>> {
        self.locks
            .entry(community.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl MigrationStore for InMemoryStore {
    async fn lock_community(&self, community: &CommunityId) -> Result<CommunityLock, StoreError> {
        let handle = self.lock_handle(community);
        let guard = handle.lock_owned().await;
        tracing::trace!(community = %community, "community lock acquired");
        Ok(CommunityLock::new(community.clone(), guard))
    }

    async fn list_communities(&self) -> Result<Vec<CommunityId>, StoreError> {
        let mut ids: Vec<CommunityId> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn load_state(
        &self,
        community: &CommunityId,
    ) -> Result<Option<CommunityMigrationState>, StoreError> {
        Ok(self.states.get(community).map(|s| s.clone()))
    }

    async fn save_state(
        &self,
        state: &CommunityMigrationState,
        lock: &CommunityLock,
    ) -> Result<(), StoreError> {
        if lock.community() != &state.community_id {
            return Err(StoreError::Conflict(format!(
                "lock for {} cannot write state of {}",
                lock.community(),
                state.community_id
            )));
        }
        self.states.insert(state.community_id.clone(), state.clone());
        Ok(())
    }

    async fn load_profile(
        &self,
        community: &CommunityId,
    ) -> Result<Option<IncumbentProfile>, StoreError> {
        Ok(self.profiles.get(community).map(|p| p.clone()))
    }

    async fn save_profile(&self, profile: &IncumbentProfile) -> Result<(), StoreError> {
        self.profiles
            .insert(profile.community_id.clone(), profile.clone());
        Ok(())
    }

    async fn load_member_record(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Option<ShadowMemberRecord>, StoreError> {
        Ok(self
            .members
            .get(community)
            .and_then(|m| m.get(member).cloned()))
    }

    async fn upsert_member_record(&self, record: &ShadowMemberRecord) -> Result<(), StoreError> {
        self.members
            .entry(record.community_id.clone())
            .or_default()
            .insert(record.member_id.clone(), record.clone());
        Ok(())
    }

    async fn list_member_records(
        &self,
        community: &CommunityId,
    ) -> Result<Vec<ShadowMemberRecord>, StoreError> {
        Ok(self
            .members
            .get(community)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn append_divergence(&self, divergence: &Divergence) -> Result<(), StoreError> {
        self.divergences
            .entry(divergence.community_id.clone())
            .or_default()
            .push(divergence.clone());
        Ok(())
    }

    async fn open_divergences(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Vec<Divergence>, StoreError> {
        Ok(self
            .divergences
            .get(community)
            .map(|all| {
                all.iter()
                    .filter(|d| &d.member_id == member && d.is_unresolved())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn resolve_divergence(
        &self,
        community: &CommunityId,
        id: Ulid,
        resolution: DivergenceResolution,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut all = self
            .divergences
            .get_mut(community)
            .ok_or_else(|| StoreError::NotFound(format!("divergences of {community}")))?;
        let divergence = all
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("divergence {id}")))?;
        if divergence.resolved_at.is_none() {
            divergence.resolved_at = Some(at);
            divergence.resolution = Some(resolution);
        }
        Ok(())
    }

    async fn list_divergences(
        &self,
        community: &CommunityId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Divergence>, StoreError> {
        let mut out: Vec<Divergence> = self
            .divergences
            .get(community)
            .map(|all| {
                all.iter()
                    .filter(|d| since.map_or(true, |s| d.detected_at >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|d| (d.detected_at, d.id));
        Ok(out)
    }

    async fn save_prediction(&self, prediction: &Prediction) -> Result<(), StoreError> {
        self.predictions
            .entry(prediction.community_id.clone())
            .or_default()
            .insert(prediction.id, prediction.clone());
        Ok(())
    }

    async fn list_predictions(
        &self,
        community: &CommunityId,
        outcome: Option<PredictionOutcome>,
    ) -> Result<Vec<Prediction>, StoreError> {
        Ok(self
            .predictions
            .get(community)
            .map(|all| {
                all.values()
                    .filter(|p| outcome.map_or(true, |o| p.outcome == o))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_health_check(&self, record: &HealthCheckRecord) -> Result<(), StoreError> {
        let cutoff = record.checked_at - self.retention;
        let mut records = self.health.entry(record.community_id.clone()).or_default();
        records.retain(|r| r.checked_at >= cutoff);
        records.push(record.clone());
        Ok(())
    }

    async fn latest_health_check(
        &self,
        community: &CommunityId,
    ) -> Result<Option<HealthCheckRecord>, StoreError> {
        Ok(self
            .health
            .get(community)
            .and_then(|all| all.iter().max_by_key(|r| r.checked_at).cloned()))
    }

    async fn last_alert_at(
        &self,
        community: &CommunityId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.health.get(community).and_then(|all| {
            all.iter()
                .filter(|r| r.alerted)
                .map(|r| r.checked_at)
                .max()
        }))
    }

    async fn record_access_sample(&self, sample: &AccessSample) -> Result<(), StoreError> {
        let cutoff = sample.sampled_at - self.retention;
        let mut samples = self.samples.entry(sample.community_id.clone()).or_default();
        samples.retain(|s| s.sampled_at >= cutoff);
        samples.push(sample.clone());
        Ok(())
    }

    async fn access_samples_since(
        &self,
        community: &CommunityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<AccessSample>, StoreError> {
        Ok(self
            .samples
            .get(community)
            .map(|all| {
                all.iter()
                    .filter(|s| s.sampled_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn audit_tail(&self, community: &CommunityId) -> Result<Option<AuditEntry>, StoreError> {
        Ok(self
            .audit
            .get(community)
            .and_then(|chain| chain.last().cloned()))
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut chain = self.audit.entry(entry.community_id.clone()).or_default();
        let (expected_seq, expected_prev) = chain
            .last()
            .map_or((0, [0u8; 32]), |tail| (tail.sequence + 1, tail.hash));
        if entry.sequence != expected_seq || entry.prev_hash != expected_prev {
            return Err(StoreError::Conflict(format!(
                "audit entry {} does not extend chain of {}",
                entry.sequence, entry.community_id
            )));
        }
        chain.push(entry.clone());
        Ok(())
    }

    async fn audit_log(&self, community: &CommunityId) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .audit
            .get(community)
            .map(|chain| chain.clone())
            .unwrap_or_default())
    }
}
