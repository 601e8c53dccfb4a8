//! Fakes for the non-platform collaborators and a fault-injecting store

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use coex_core::{
    AccessSample, AlertSink, AuditEntry, Clock, CollaboratorError, CommunityId,
    CommunityMigrationState, Divergence, DivergenceResolution, EligibilityProvider,
    EligibilityResult, HealthCheckRecord, IdentityResolver, IncumbentProfile, LinkedIdentity,
    MemberId, OperatorAlert, Prediction, PredictionOutcome, ShadowMemberRecord, StoreError,
};
use coex_store::{CommunityLock, MigrationStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use ulid::Ulid;

/// Eligibility provider backed by a table; unknown identities are ineligible
#[derive(Debug, Default)]
pub struct FakeEligibility {
    results: RwLock<BTreeMap<LinkedIdentity, EligibilityResult>>,
    failing: RwLock<BTreeSet<LinkedIdentity>>,
    calls: AtomicUsize,
}

impl FakeEligibility {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, identity: &str, result: EligibilityResult) {
        self.results.write().insert(LinkedIdentity::from(identity), result);
    }

    pub fn fail(&self, identity: &str) {
        self.failing.write().insert(LinkedIdentity::from(identity));
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EligibilityProvider for FakeEligibility {
    async fn evaluate(&self, identity: &LinkedIdentity) -> Result<EligibilityResult, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.read().contains(identity) {
            return Err(CollaboratorError::unavailable("fake-eligibility", "injected"));
        }
        Ok(self
            .results
            .read()
            .get(identity)
            .cloned()
            .unwrap_or_else(|| EligibilityResult::ineligible(0.0)))
    }
}

/// Member -> identity table shared by every community
#[derive(Debug, Default)]
pub struct FakeIdentities {
    links: RwLock<BTreeMap<MemberId, LinkedIdentity>>,
}

impl FakeIdentities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, member: &str, identity: &str) {
        self.links
            .write()
            .insert(MemberId::from(member), LinkedIdentity::from(identity));
    }

    pub fn unlink(&self, member: &str) {
        self.links.write().remove(&MemberId::from(member));
    }
}

#[async_trait]
impl IdentityResolver for FakeIdentities {
    async fn linked_identity(
        &self,
        _community: &CommunityId,
        member: &MemberId,
    ) -> Result<Option<LinkedIdentity>, CollaboratorError> {
        Ok(self.links.read().get(member).cloned())
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Alert sink that keeps everything it is sent
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    sent: Mutex<Vec<OperatorAlert>>,
    failing: AtomicBool,
}

impl RecordingAlerts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<OperatorAlert> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn send(&self, alert: OperatorAlert) -> Result<(), CollaboratorError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(CollaboratorError::unavailable("fake-alerts", "injected"));
        }
        self.sent.lock().push(alert);
        Ok(())
    }
}

/// Store decorator that can refuse aggregate writes
#[derive(Debug)]
pub struct FailingStore<S> {
    inner: S,
    fail_state_writes: AtomicBool,
}

impl<S: MigrationStore> FailingStore<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_state_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_state_writes(&self, fail: bool) {
        self.fail_state_writes.store(fail, Ordering::Relaxed);
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: MigrationStore> MigrationStore for FailingStore<S> {
    async fn lock_community(&self, community: &CommunityId) -> Result<CommunityLock, StoreError> {
        self.inner.lock_community(community).await
    }

    async fn list_communities(&self) -> Result<Vec<CommunityId>, StoreError> {
        self.inner.list_communities().await
    }

    async fn load_state(
        &self,
        community: &CommunityId,
    ) -> Result<Option<CommunityMigrationState>, StoreError> {
        self.inner.load_state(community).await
    }

    async fn save_state(
        &self,
        state: &CommunityMigrationState,
        lock: &CommunityLock,
    ) -> Result<(), StoreError> {
        if self.fail_state_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("injected state write failure".into()));
        }
        self.inner.save_state(state, lock).await
    }

    async fn load_profile(
        &self,
        community: &CommunityId,
    ) -> Result<Option<IncumbentProfile>, StoreError> {
        self.inner.load_profile(community).await
    }

    async fn save_profile(&self, profile: &IncumbentProfile) -> Result<(), StoreError> {
        self.inner.save_profile(profile).await
    }

    async fn load_member_record(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Option<ShadowMemberRecord>, StoreError> {
        self.inner.load_member_record(community, member).await
    }

    async fn upsert_member_record(&self, record: &ShadowMemberRecord) -> Result<(), StoreError> {
        self.inner.upsert_member_record(record).await
    }

    async fn list_member_records(
        &self,
        community: &CommunityId,
    ) -> Result<Vec<ShadowMemberRecord>, StoreError> {
        self.inner.list_member_records(community).await
    }

    async fn append_divergence(&self, divergence: &Divergence) -> Result<(), StoreError> {
        self.inner.append_divergence(divergence).await
    }

    async fn open_divergences(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Vec<Divergence>, StoreError> {
        self.inner.open_divergences(community, member).await
    }

    async fn resolve_divergence(
        &self,
        community: &CommunityId,
        id: Ulid,
        resolution: DivergenceResolution,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.resolve_divergence(community, id, resolution, at).await
    }

    async fn list_divergences(
        &self,
        community: &CommunityId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Divergence>, StoreError> {
        self.inner.list_divergences(community, since).await
    }

    async fn save_prediction(&self, prediction: &Prediction) -> Result<(), StoreError> {
        self.inner.save_prediction(prediction).await
    }

    async fn list_predictions(
        &self,
        community: &CommunityId,
        outcome: Option<PredictionOutcome>,
    ) -> Result<Vec<Prediction>, StoreError> {
        self.inner.list_predictions(community, outcome).await
    }

    async fn record_health_check(&self, record: &HealthCheckRecord) -> Result<(), StoreError> {
        self.inner.record_health_check(record).await
    }

    async fn latest_health_check(
        &self,
        community: &CommunityId,
    ) -> Result<Option<HealthCheckRecord>, StoreError> {
        self.inner.latest_health_check(community).await
    }

    async fn last_alert_at(
        &self,
        community: &CommunityId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.last_alert_at(community).await
    }

    async fn record_access_sample(&self, sample: &AccessSample) -> Result<(), StoreError> {
        self.inner.record_access_sample(sample).await
    }

    async fn access_samples_since(
        &self,
        community: &CommunityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<AccessSample>, StoreError> {
        self.inner.access_samples_since(community, since).await
    }

    async fn audit_tail(&self, community: &CommunityId) -> Result<Option<AuditEntry>, StoreError> {
        self.inner.audit_tail(community).await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.inner.append_audit(entry).await
    }

    async fn audit_log(&self, community: &CommunityId) -> Result<Vec<AuditEntry>, StoreError> {
        self.inner.audit_log(community).await
    }
}
