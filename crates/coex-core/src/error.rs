//! Error types for the migration engine
//!
//! Provides the error taxonomy:
//! - Transient infrastructure failures (platform, eligibility, storage, timeouts)
//! - Irreversibility violations
//! - Invariant violations (programming-contract breaches)
//! - Configuration errors
//!
//! Readiness rejections are not errors; they are typed outcomes returned by the
//! engine.

use crate::state_machine::TransitionError;
use crate::types::{CommunityId, MigrationMode};

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum CoexError {
    /// Platform, eligibility or identity collaborator failed
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Storage layer failed
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Contract breach; never retried, never swallowed
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// Regressive call against EXCLUSIVE
    #[error("community {community} is in EXCLUSIVE mode; the migration is irreversible")]
    IrreversibleState { community: CommunityId },

    /// State machine rejected the transition
    #[error("transition rejected: {0}")]
    Transition(TransitionError),

    /// Mode moved on between an observation and the locked write
    #[error("community {community} is in {actual}, expected {expected}")]
    StaleMode {
        community: CommunityId,
        expected: MigrationMode,
        actual: MigrationMode,
    },

    /// Community has no migration state yet
    #[error("community {0} is not managed; run incumbent detection first")]
    NotManaged(CommunityId),

    /// Too many members failed for the sync to count
    #[error("shadow sync incomplete for {community}: {failed} of {total} members failed")]
    SyncIncomplete {
        community: CommunityId,
        failed: usize,
        total: usize,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Timeout
    #[error("operation timed out after {duration_secs}s")]
    Timeout { duration_secs: u64 },
}

impl CoexError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Collaborator(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            Self::SyncIncomplete { .. } | Self::Timeout { .. } => true,
            Self::Invariant(_)
            | Self::IrreversibleState { .. }
            | Self::Transition(_)
            | Self::StaleMode { .. }
            | Self::NotManaged(_)
            | Self::Config(_) => false,
        }
    }

    /// Check if error is a programming-contract breach
    #[inline]
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    /// Map a state-machine rejection, promoting terminal-mode rejections
    #[must_use]
    pub fn from_transition(community: &CommunityId, err: TransitionError) -> Self {
        match err {
            TransitionError::Irreversible { .. } => Self::IrreversibleState {
                community: community.clone(),
            },
            other => Self::Transition(other),
        }
    }
}

/// Errors from external collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Network or upstream failure
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    /// Upstream rate limit
    #[error("{service} rate limited")]
    RateLimited { service: String },

    /// Entity does not exist upstream
    #[error("{service}: {what} not found")]
    NotFound { service: String, what: String },

    /// Upstream refused the request
    #[error("{service} rejected request: {reason}")]
    Rejected { service: String, reason: String },
}

impl CollaboratorError {
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::RateLimited { .. })
    }

    /// Shorthand for an unavailable service
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }
}

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("audit chain broken at sequence {sequence}")]
    AuditChainBroken { sequence: u64 },
}

impl StoreError {
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Conflict(_))
    }
}

/// Contract breaches that must fail loudly
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// Shadow ledger invoked outside SHADOW
    #[error("shadow sync invoked in {mode} mode for {community}")]
    ShadowOutsideShadowMode {
        community: CommunityId,
        mode: MigrationMode,
    },

    /// Namespaced grant manager invoked without authority
    #[error("namespaced grant mutation invoked in {mode} mode for {community}")]
    MutationWithoutAuthority {
        community: CommunityId,
        mode: MigrationMode,
    },

    /// Attempt to touch a grant outside the reserved namespace
    #[error("grant {grant} is outside the reserved namespace {prefix}")]
    NonNamespacedGrant { grant: String, prefix: String },
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("cannot parse configuration: {0}")]
    Parse(String),

    #[error("invalid {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
