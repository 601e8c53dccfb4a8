//! Core types for the migration engine
//!
//! Defines the fundamental data model:
//! - Identifiers for communities, members, grants and automations
//! - Migration modes and strategies
//! - The per-community migration aggregate
//! - Incumbent profile, shadow member records and divergence history
//! - Predictions, health records and access samples

use crate::state_machine::{self, TransitionError, TransitionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use ulid::Ulid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create from anything string-like
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Managed community (guild, server, workspace)
    CommunityId
);
string_id!(
    /// Member of a community
    MemberId
);
string_id!(
    /// Platform grant (role) identifier
    GrantId
);
string_id!(
    /// Automated actor (bot account) identifier
    AutomationId
);
string_id!(
    /// External identity linked to a member, e.g. a wallet address
    LinkedIdentity
);

/// Authority mode of a community
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationMode {
    /// Observe and compute only
    Shadow,
    /// Namespaced grants mirror the new system next to the incumbent
    Parallel,
    /// New system is authoritative; incumbent is a live backup
    Primary,
    /// New system is the only authority (terminal)
    Exclusive,
}

impl MigrationMode {
    /// All modes in escalation order
    pub const ALL: [MigrationMode; 4] = [
        MigrationMode::Shadow,
        MigrationMode::Parallel,
        MigrationMode::Primary,
        MigrationMode::Exclusive,
    ];

    /// Stable wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationMode::Shadow => "SHADOW",
            MigrationMode::Parallel => "PARALLEL",
            MigrationMode::Primary => "PRIMARY",
            MigrationMode::Exclusive => "EXCLUSIVE",
        }
    }

    /// Whether the namespaced grant manager may mutate in this mode
    #[inline]
    #[must_use]
    pub fn allows_namespaced_mutation(&self) -> bool {
        matches!(self, MigrationMode::Parallel | MigrationMode::Primary)
    }

    /// Whether the new system makes access decisions in this mode
    #[inline]
    #[must_use]
    pub fn new_system_authoritative(&self) -> bool {
        matches!(self, MigrationMode::Primary | MigrationMode::Exclusive)
    }

    /// One step back, if any
    #[inline]
    #[must_use]
    pub fn rollback_target(&self) -> Option<MigrationMode> {
        match self {
            MigrationMode::Primary => Some(MigrationMode::Parallel),
            MigrationMode::Parallel => Some(MigrationMode::Shadow),
            MigrationMode::Shadow | MigrationMode::Exclusive => None,
        }
    }

    /// Terminal modes cannot be left
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationMode::Exclusive)
    }
}

impl std::fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHADOW" => Ok(MigrationMode::Shadow),
            "PARALLEL" => Ok(MigrationMode::Parallel),
            "PRIMARY" => Ok(MigrationMode::Primary),
            "EXCLUSIVE" => Ok(MigrationMode::Exclusive),
            other => Err(format!("unknown migration mode: {other}")),
        }
    }
}

/// How authority is handed over once coexistence starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStrategy {
    /// Mirror every member at once
    Instant,
    /// Mirror a growing share of members per sync
    Gradual,
    /// Stay in PARALLEL indefinitely
    ParallelForever,
    /// Go straight through PARALLEL to PRIMARY in one request
    NewSystemPrimary,
}

impl MigrationStrategy {
    /// Stable wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStrategy::Instant => "INSTANT",
            MigrationStrategy::Gradual => "GRADUAL",
            MigrationStrategy::ParallelForever => "PARALLEL_FOREVER",
            MigrationStrategy::NewSystemPrimary => "NEW_SYSTEM_PRIMARY",
        }
    }
}

impl std::fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "INSTANT" => Ok(MigrationStrategy::Instant),
            "GRADUAL" => Ok(MigrationStrategy::Gradual),
            "PARALLEL_FOREVER" => Ok(MigrationStrategy::ParallelForever),
            "NEW_SYSTEM_PRIMARY" => Ok(MigrationStrategy::NewSystemPrimary),
            other => Err(format!("unknown migration strategy: {other}")),
        }
    }
}

/// Per-community migration aggregate
///
/// `mode` is private: it only moves through [`CommunityMigrationState::apply_transition`]
/// and [`CommunityMigrationState::apply_rollback`], both validated against the
/// state-machine table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityMigrationState {
    /// Owning community
    pub community_id: CommunityId,
    mode: MigrationMode,
    /// Strategy chosen when coexistence started
    pub strategy: Option<MigrationStrategy>,
    /// First entry into SHADOW
    pub shadow_started_at: Option<DateTime<Utc>>,
    /// First entry into PARALLEL
    pub parallel_enabled_at: Option<DateTime<Utc>>,
    /// First entry into PRIMARY
    pub primary_enabled_at: Option<DateTime<Utc>>,
    /// Entry into EXCLUSIVE
    pub exclusive_enabled_at: Option<DateTime<Utc>>,
    /// Number of rollbacks so far
    pub rollback_count: u32,
    /// Time of the last rollback
    pub last_rollback_at: Option<DateTime<Utc>>,
    /// Reason given for the last rollback
    pub last_rollback_reason: Option<String>,
    /// Shadow accuracy, 0-100
    pub accuracy_percent: f64,
    /// Cached result of the last readiness evaluation
    pub readiness_check_passed: bool,
    /// Share of members mirrored by the namespaced grant manager, 0-100
    pub rollout_percent: u8,
    /// End of the last committed shadow sync
    pub last_shadow_sync_at: Option<DateTime<Utc>>,
    /// Last mutation of this aggregate
    pub updated_at: DateTime<Utc>,
}

impl CommunityMigrationState {
    /// Fresh aggregate in SHADOW
    #[must_use]
    pub fn new(community_id: CommunityId, now: DateTime<Utc>) -> Self {
        Self {
            community_id,
            mode: MigrationMode::Shadow,
            strategy: None,
            shadow_started_at: Some(now),
            parallel_enabled_at: None,
            primary_enabled_at: None,
            exclusive_enabled_at: None,
            rollback_count: 0,
            last_rollback_at: None,
            last_rollback_reason: None,
            accuracy_percent: 0.0,
            readiness_check_passed: false,
            rollout_percent: 0,
            last_shadow_sync_at: None,
            updated_at: now,
        }
    }

    /// Current mode
    #[inline]
    #[must_use]
    pub fn mode(&self) -> MigrationMode {
        self.mode
    }

    /// Move forward to `to`, stamping the first-entry timestamp once
    pub fn apply_transition(
        &mut self,
        to: MigrationMode,
        kind: TransitionKind,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        state_machine::validate_transition(self.mode, to, kind)?;
        self.mode = to;
        let slot = match to {
            MigrationMode::Shadow => &mut self.shadow_started_at,
            MigrationMode::Parallel => &mut self.parallel_enabled_at,
            MigrationMode::Primary => &mut self.primary_enabled_at,
            MigrationMode::Exclusive => &mut self.exclusive_enabled_at,
        };
        if slot.is_none() {
            *slot = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Step one mode back, recording the reason
    ///
    /// # Errors
    /// `TransitionError::Irreversible` from EXCLUSIVE, `TransitionError::Illegal`
    /// from SHADOW. The aggregate is untouched on error.
    pub fn apply_rollback(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<MigrationMode, TransitionError> {
        let target = match self.mode.rollback_target() {
            Some(target) => target,
            None if self.mode.is_terminal() => {
                return Err(TransitionError::Irreversible { from: self.mode })
            }
            None => {
                return Err(TransitionError::Illegal {
                    from: self.mode,
                    to: self.mode,
                })
            }
        };
        state_machine::validate_transition(self.mode, target, TransitionKind::Rollback)?;
        self.mode = target;
        self.rollback_count += 1;
        self.last_rollback_at = Some(now);
        self.last_rollback_reason = Some(reason.into());
        self.readiness_check_passed = false;
        self.updated_at = now;
        Ok(target)
    }
}

/// Health of the incumbent as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthStatus {
    /// Whether operators should hear about it
    #[inline]
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Warning | HealthStatus::Critical)
    }
}

/// Which profiler heuristic identified the incumbent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionTier {
    /// Exact known automation identity
    KnownAutomation,
    /// Verification-flow channel naming
    ChannelPattern,
    /// Access-tier grant naming
    GrantPattern,
    /// Automation name that suggests gating
    Fallback,
}

/// What the profiler knows about the incumbent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncumbentProfile {
    /// Owning community
    pub community_id: CommunityId,
    /// Provider identifier or "unknown"
    pub provider: String,
    /// Detection confidence, 0-1
    pub confidence: f64,
    /// Heuristic that produced the match
    pub detection_tier: DetectionTier,
    /// Automation account controlling access, if identified
    pub automation_identity: Option<AutomationId>,
    /// Channels used by the incumbent's verification flow
    pub monitored_channels: Vec<String>,
    /// Grant name -> confidence that the grant is access-controlling
    pub suspect_grants: BTreeMap<String, f64>,
    /// Lower-confidence providers seen at the same time
    pub alternates: Vec<String>,
    /// Catalog version used for detection
    pub catalog_version: u32,
    /// When the profile was first produced
    pub detected_at: DateTime<Utc>,
    /// Last health verdict
    pub health_status: HealthStatus,
    /// When health was last checked
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl IncumbentProfile {
    /// Grants that count as incumbent access for a given confidence floor
    #[must_use]
    pub fn access_grants(&self, min_confidence: f64) -> BTreeSet<&str> {
        self.suspect_grants
            .iter()
            .filter(|(_, c)| **c >= min_confidence)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Comparison verdict for one member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DivergenceStatus {
    Match,
    NewSystemHigher,
    NewSystemLower,
    Unknown,
}

impl DivergenceStatus {
    /// A known disagreement
    #[inline]
    #[must_use]
    pub fn is_divergent(&self) -> bool {
        matches!(
            self,
            DivergenceStatus::NewSystemHigher | DivergenceStatus::NewSystemLower
        )
    }
}

/// Feature-access tier derived from participation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationTier {
    IncumbentOnly,
    LinkedBasic,
    Full,
}

/// Per-member shadow comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowMemberRecord {
    pub community_id: CommunityId,
    pub member_id: MemberId,
    /// Grant names observed on the member
    pub incumbent_grants: BTreeSet<String>,
    pub linked_identity: Option<LinkedIdentity>,
    /// Tier computed by the new system
    pub computed_eligibility: Option<String>,
    pub computed_score: Option<f64>,
    /// Namespaced grants the new system would hold for the member
    pub would_grant: BTreeSet<String>,
    /// Incumbent access grants the new system would not keep
    pub would_revoke: BTreeSet<String>,
    pub divergence_status: DivergenceStatus,
    pub verification_tier: VerificationTier,
    pub updated_at: DateTime<Utc>,
}

impl ShadowMemberRecord {
    /// Record for a member without a linked identity
    #[must_use]
    pub fn unlinked(
        community_id: CommunityId,
        member_id: MemberId,
        incumbent_grants: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            community_id,
            member_id,
            incumbent_grants,
            linked_identity: None,
            computed_eligibility: None,
            computed_score: None,
            would_grant: BTreeSet::new(),
            would_revoke: BTreeSet::new(),
            divergence_status: DivergenceStatus::Unknown,
            verification_tier: VerificationTier::IncumbentOnly,
            updated_at: now,
        }
    }

    /// Comparison-relevant content, ignoring timestamps
    #[must_use]
    pub fn same_observation(&self, other: &ShadowMemberRecord) -> bool {
        self.incumbent_grants == other.incumbent_grants
            && self.linked_identity == other.linked_identity
            && self.computed_eligibility == other.computed_eligibility
            && self.divergence_status == other.divergence_status
    }
}

/// Direction of a recorded disagreement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DivergenceKind {
    NewSystemHigher,
    NewSystemLower,
}

impl DivergenceKind {
    /// Kind for a divergent status
    #[inline]
    #[must_use]
    pub fn from_status(status: DivergenceStatus) -> Option<Self> {
        match status {
            DivergenceStatus::NewSystemHigher => Some(DivergenceKind::NewSystemHigher),
            DivergenceStatus::NewSystemLower => Some(DivergenceKind::NewSystemLower),
            DivergenceStatus::Match | DivergenceStatus::Unknown => None,
        }
    }
}

/// How a divergence stopped being open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DivergenceResolution {
    /// Incumbent changed to agree with the new system
    IncumbentMatched,
    /// New system's computation changed to agree with the incumbent
    NewSystemWrong,
    /// Superseded by a disagreement in the other direction
    StillDivergent,
}

/// Append-only divergence history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    pub id: Ulid,
    pub community_id: CommunityId,
    pub member_id: MemberId,
    pub kind: DivergenceKind,
    /// Incumbent access grants at detection
    pub incumbent_state: BTreeSet<String>,
    /// Tier computed by the new system at detection
    pub new_system_state: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<DivergenceResolution>,
}

impl Divergence {
    /// Still open
    #[inline]
    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// What a prediction expects the incumbent to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionType {
    IncumbentWillGrant,
    IncumbentWillRevoke,
}

/// Prediction outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionOutcome {
    Pending,
    Correct,
    Incorrect,
}

/// Self-validation record; never has authority over grants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Ulid,
    pub community_id: CommunityId,
    pub member_id: MemberId,
    pub prediction_type: PredictionType,
    pub predicted_at: DateTime<Utc>,
    pub details: String,
    pub outcome: PredictionOutcome,
    pub outcome_at: Option<DateTime<Utc>>,
}

/// Severity of one health finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Critical,
}

/// One health finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

impl HealthIssue {
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Critical,
            message: message.into(),
        }
    }
}

/// Persisted health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub community_id: CommunityId,
    pub checked_at: DateTime<Utc>,
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
    /// Whether an operator alert went out for this check
    pub alerted: bool,
}

/// Outcome of one namespaced grant sync, consumed by the rollback watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessSample {
    pub community_id: CommunityId,
    pub sampled_at: DateTime<Utc>,
    /// Members holding any namespaced grant before the sync
    pub members_with_access: u64,
    /// Of those, members left with none after the sync
    pub members_lost_access: u64,
    pub grants_added: u64,
    pub grants_removed: u64,
    pub operation_errors: u64,
    pub operations: u64,
}

/// Result of the eligibility collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityResult {
    /// Tier name when eligible
    pub tier: Option<String>,
    pub score: f64,
}

impl EligibilityResult {
    /// Eligible at `tier`
    #[must_use]
    pub fn eligible(tier: impl Into<String>, score: f64) -> Self {
        Self {
            tier: Some(tier.into()),
            score,
        }
    }

    /// Below every threshold
    #[must_use]
    pub fn ineligible(score: f64) -> Self {
        Self { tier: None, score }
    }
}

/// Platform grant as listed by the platform client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub id: GrantId,
    pub name: String,
    /// Ordering on the platform; higher is more senior
    pub position: i32,
    pub permissions: BTreeSet<String>,
}

/// Request to create a grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSpec {
    pub name: String,
    pub position: i32,
    pub permissions: BTreeSet<String>,
}

/// Platform channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

/// Automated actor present in a community
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Automation {
    pub id: AutomationId,
    pub name: String,
    pub online: bool,
}
