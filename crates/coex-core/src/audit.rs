use crate::error::StoreError;
use crate::types::{CommunityId, MigrationMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditAction {
    ModeChanged {
        from: MigrationMode,
        to: MigrationMode,
    },
    RolledBack {
        from: MigrationMode,
        to: MigrationMode,
        automatic: bool,
    },
    EmergencyBackup {
        from: MigrationMode,
    },
    RollbackEscalated,
}

impl AuditAction {
    fn tag(&self) -> String {
        match self {
            AuditAction::ModeChanged { from, to } => format!("mode_changed:{from}:{to}"),
            AuditAction::RolledBack { from, to, automatic } => {
                format!("rolled_back:{from}:{to}:{automatic}")
            }
            AuditAction::EmergencyBackup { from } => format!("emergency_backup:{from}"),
            AuditAction::RollbackEscalated => "rollback_escalated".to_string(),
        }
    }
}

/// Hash-chained audit record, one chain per community
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub community_id: CommunityId,
    pub recorded_at: DateTime<Utc>,
    /// Operator id, or "system" for automatic actions
    pub actor: String,
    pub action: AuditAction,
    pub detail: String,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl AuditEntry {
    /// Build the next entry of a chain whose tail is `prev`
    #[must_use]
    pub fn chained(
        prev: Option<&AuditEntry>,
        community_id: CommunityId,
        recorded_at: DateTime<Utc>,
        actor: impl Into<String>,
        action: AuditAction,
        detail: impl Into<String>,
    ) -> Self {
        let mut entry = Self {
            sequence: prev.map_or(0, |p| p.sequence + 1),
            community_id,
            recorded_at,
            actor: actor.into(),
            action,
            detail: detail.into(),
            prev_hash: prev.map_or([0u8; 32], |p| p.hash),
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        entry
    }

    /// Hex form of the entry hash
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Check sequence numbers, back-links and hashes of a whole chain
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), StoreError> {
    let mut prev = [0u8; 32];
    for (i, e) in entries.iter().enumerate() {
        if e.sequence != i as u64 || e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(StoreError::AuditChainBroken { sequence: e.sequence });
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.sequence.to_le_bytes());
    hasher.update(entry.community_id.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.recorded_at.timestamp_micros().to_le_bytes());
    hasher.update(entry.actor.as_bytes());
    hasher.update([0]);
    hasher.update(entry.action.tag().as_bytes());
    hasher.update([0]);
    hasher.update(entry.detail.as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}
