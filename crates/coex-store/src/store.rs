//! Storage contract
//!
//! Persists the five entities of the data model plus health records, access
//! samples and the audit chain, keyed by community (and member where relevant).
//!
//! Only `CommunityMigrationState` needs exclusive-write discipline: writing it
//! requires a [`CommunityLock`] for the same community. Member records,
//! divergences and predictions are last-write-wins.

use crate::lock::CommunityLock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coex_core::{
    AccessSample, AuditEntry, CommunityId, CommunityMigrationState, Divergence,
    DivergenceResolution, HealthCheckRecord, IncumbentProfile, MemberId, Prediction,
    PredictionOutcome, ShadowMemberRecord, StoreError,
};
use ulid::Ulid;

#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Acquire the exclusive lock for `community`, waiting if held
    async fn lock_community(&self, community: &CommunityId) -> Result<CommunityLock, StoreError>;

    async fn list_communities(&self) -> Result<Vec<CommunityId>, StoreError>;

    async fn load_state(
        &self,
        community: &CommunityId,
    ) -> Result<Option<CommunityMigrationState>, StoreError>;

    /// Persist the aggregate; `lock` must cover the same community
    async fn save_state(
        &self,
        state: &CommunityMigrationState,
        lock: &CommunityLock,
    ) -> Result<(), StoreError>;

    async fn load_profile(
        &self,
        community: &CommunityId,
    ) -> Result<Option<IncumbentProfile>, StoreError>;

    async fn save_profile(&self, profile: &IncumbentProfile) -> Result<(), StoreError>;

    async fn load_member_record(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Option<ShadowMemberRecord>, StoreError>;

    async fn upsert_member_record(&self, record: &ShadowMemberRecord) -> Result<(), StoreError>;

    async fn list_member_records(
        &self,
        community: &CommunityId,
    ) -> Result<Vec<ShadowMemberRecord>, StoreError>;

    async fn append_divergence(&self, divergence: &Divergence) -> Result<(), StoreError>;

    /// Unresolved divergences for one member
    async fn open_divergences(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Vec<Divergence>, StoreError>;

    async fn resolve_divergence(
        &self,
        community: &CommunityId,
        id: Ulid,
        resolution: DivergenceResolution,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Divergences detected at or after `since` (all when `None`), oldest first
    async fn list_divergences(
        &self,
        community: &CommunityId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Divergence>, StoreError>;

    /// Insert or replace by id
    async fn save_prediction(&self, prediction: &Prediction) -> Result<(), StoreError>;

    async fn list_predictions(
        &self,
        community: &CommunityId,
        outcome: Option<PredictionOutcome>,
    ) -> Result<Vec<Prediction>, StoreError>;

    async fn record_health_check(&self, record: &HealthCheckRecord) -> Result<(), StoreError>;

    async fn latest_health_check(
        &self,
        community: &CommunityId,
    ) -> Result<Option<HealthCheckRecord>, StoreError>;

    /// Time of the most recent health check that raised an alert
    async fn last_alert_at(&self, community: &CommunityId)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn record_access_sample(&self, sample: &AccessSample) -> Result<(), StoreError>;

    async fn access_samples_since(
        &self,
        community: &CommunityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<AccessSample>, StoreError>;

    async fn audit_tail(&self, community: &CommunityId) -> Result<Option<AuditEntry>, StoreError>;

    /// Append to the community's chain; rejects entries that do not extend the tail
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    async fn audit_log(&self, community: &CommunityId) -> Result<Vec<AuditEntry>, StoreError>;
}
