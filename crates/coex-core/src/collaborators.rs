//! Contracts for the systems the engine talks to
//!
//! The platform client, the eligibility provider and the identity resolver
//! are implemented elsewhere; the engine only sees these traits.

use crate::error::CollaboratorError;
use crate::types::{
    Automation, AutomationId, Channel, CommunityId, EligibilityResult, Grant, GrantId, GrantSpec,
    LinkedIdentity, MemberId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Community platform client (roles, members, channels)
///
/// Split into read and write halves: the shadow ledger is handed a
/// [`PlatformReader`] only, so it cannot mutate by construction.
#[async_trait]
pub trait PlatformReader: Send + Sync {
    async fn list_members(&self, community: &CommunityId) -> Result<Vec<MemberId>, CollaboratorError>;

    async fn get_member_grants(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Vec<GrantId>, CollaboratorError>;

    async fn list_grants(&self, community: &CommunityId) -> Result<Vec<Grant>, CollaboratorError>;

    async fn list_channels(&self, community: &CommunityId) -> Result<Vec<Channel>, CollaboratorError>;

    async fn list_automations(
        &self,
        community: &CommunityId,
    ) -> Result<Vec<Automation>, CollaboratorError>;

    /// Most recent grant change performed by `automation`, if any was observed
    async fn latest_grant_activity(
        &self,
        community: &CommunityId,
        automation: &AutomationId,
    ) -> Result<Option<DateTime<Utc>>, CollaboratorError>;
}

/// Mutating half of the platform client
#[async_trait]
pub trait PlatformWriter: Send + Sync {
    async fn add_grant(
        &self,
        community: &CommunityId,
        member: &MemberId,
        grant: &GrantId,
    ) -> Result<(), CollaboratorError>;

    async fn remove_grant(
        &self,
        community: &CommunityId,
        member: &MemberId,
        grant: &GrantId,
    ) -> Result<(), CollaboratorError>;

    async fn create_grant(
        &self,
        community: &CommunityId,
        spec: GrantSpec,
    ) -> Result<Grant, CollaboratorError>;
}

/// Full platform client
pub trait PlatformClient: PlatformReader + PlatformWriter {}

impl<T: PlatformReader + PlatformWriter> PlatformClient for T {}

/// New system's eligibility computation
#[async_trait]
pub trait EligibilityProvider: Send + Sync {
    async fn evaluate(&self, identity: &LinkedIdentity) -> Result<EligibilityResult, CollaboratorError>;
}

/// Member -> linked external identity
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn linked_identity(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Option<LinkedIdentity>, CollaboratorError>;
}

/// Action offered to the operator alongside an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    /// Force PARALLEL outside the readiness gate
    ActivateBackup,
    /// Acknowledge only
    Acknowledge,
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Operator-facing alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub community_id: CommunityId,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub actions: Vec<AlertAction>,
    pub raised_at: DateTime<Utc>,
}

/// Delivery channel for operator alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: OperatorAlert) -> Result<(), CollaboratorError>;
}
