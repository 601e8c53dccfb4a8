//! Verification tiers and the feature table behind them

use crate::context::EngineContext;
use coex_core::{CoexError, CommunityId, MemberId, MigrationMode, VerificationTier};
use serde::Serialize;

/// Whether tier progression is shown as a preview or applied for real
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Progression {
    Preview,
    Real,
}

/// Features a member can use at a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub profile_visible: bool,
    pub leaderboard_visible: bool,
    pub badge_earning: bool,
    pub tier_progression: Progression,
}

const INCUMBENT_ONLY: Capabilities = Capabilities {
    profile_visible: false,
    leaderboard_visible: false,
    badge_earning: false,
    tier_progression: Progression::Preview,
};

const LINKED_BASIC: Capabilities = Capabilities {
    profile_visible: true,
    leaderboard_visible: true,
    badge_earning: false,
    tier_progression: Progression::Preview,
};

const FULL: Capabilities = Capabilities {
    profile_visible: true,
    leaderboard_visible: true,
    badge_earning: true,
    tier_progression: Progression::Real,
};

#[must_use]
pub fn features_for(tier: VerificationTier) -> Capabilities {
    match tier {
        VerificationTier::IncumbentOnly => INCUMBENT_ONLY,
        VerificationTier::LinkedBasic => LINKED_BASIC,
        VerificationTier::Full => FULL,
    }
}

/// Tier for a member given the community mode and whether they linked an identity
#[must_use]
pub fn tier_for(mode: MigrationMode, linked: bool) -> VerificationTier {
    if mode.new_system_authoritative() {
        VerificationTier::Full
    } else if linked {
        VerificationTier::LinkedBasic
    } else {
        VerificationTier::IncumbentOnly
    }
}

pub struct TierResolver {
    ctx: EngineContext,
}

impl TierResolver {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn resolve_tier(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<VerificationTier, CoexError> {
        let state = self
            .ctx
            .store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))?;
        if state.mode().new_system_authoritative() {
            return Ok(VerificationTier::Full);
        }
        let linked = self
            .ctx
            .identities
            .linked_identity(community, member)
            .await?
            .is_some();
        Ok(tier_for(state.mode(), linked))
    }
}
