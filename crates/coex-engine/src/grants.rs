//! Parallel grant manager
//!
//! Owns the reserved grant namespace. Creates one grant per configured tier
//! and keeps member holdings in line with the new system's computation. Never
//! reads or writes a grant outside the namespace; every mutation passes
//! [`NamespacedGrantManager::guard`] first.

use crate::context::EngineContext;
use crate::telemetry;
use coex_core::{
    AccessSample, CoexError, CommunityId, CommunityMigrationState, Grant, GrantId, GrantSpec,
    InvariantViolation, MemberId, MigrationStrategy,
};
use coex_store::CommunityLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Result of namespace setup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GrantSetup {
    pub created: Vec<String>,
    pub reused: Vec<String>,
}

/// Result of one namespaced sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GrantSyncReport {
    pub added: u64,
    pub removed: u64,
    pub errors: u64,
    /// Members left alone because they are outside the rollout
    pub outside_rollout: u64,
    pub rollout_percent: u8,
}

/// Stable rollout bucket of a member, 0..100
#[must_use]
pub fn rollout_bucket(member: &MemberId) -> u8 {
    let digest = Sha256::digest(member.as_str().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    // mod 100 always fits
    u8::try_from(u64::from_be_bytes(head) % 100).unwrap_or(0)
}

/// Whether a member is mirrored at the given rollout
#[must_use]
pub fn in_rollout(member: &MemberId, rollout_percent: u8) -> bool {
    rollout_bucket(member) < rollout_percent
}

/// Managed per-tier grants currently on the platform, by id
struct Namespace {
    owned: BTreeMap<GrantId, Grant>,
    by_tier: BTreeMap<String, GrantId>,
}

#[derive(Debug, Default)]
struct MemberChange {
    had_access: bool,
    has_access: bool,
    added: u64,
    removed: u64,
    errors: u64,
}

pub struct NamespacedGrantManager {
    ctx: EngineContext,
}

impl NamespacedGrantManager {
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Create the namespaced grants, reusing any that already exist
    pub async fn setup(&self, community: &CommunityId) -> Result<GrantSetup, CoexError> {
        let _lock = self.ctx.store.lock_community(community).await?;
        let state = self.load(community).await?;
        self.setup_locked(&state).await
    }

    /// Bring member holdings in line with the new system
    pub async fn sync(&self, community: &CommunityId) -> Result<GrantSyncReport, CoexError> {
        let lock = self.ctx.store.lock_community(community).await?;
        let mut state = self.load(community).await?;
        let report = self.sync_locked(&mut state, &lock).await?;
        self.ctx.store.save_state(&state, &lock).await?;
        Ok(report)
    }

    async fn load(&self, community: &CommunityId) -> Result<CommunityMigrationState, CoexError> {
        self.ctx
            .store
            .load_state(community)
            .await?
            .ok_or_else(|| CoexError::NotManaged(community.clone()))
    }

    fn require_authority(state: &CommunityMigrationState) -> Result<(), InvariantViolation> {
        if state.mode().allows_namespaced_mutation() {
            Ok(())
        } else {
            Err(InvariantViolation::MutationWithoutAuthority {
                community: state.community_id.clone(),
                mode: state.mode(),
            })
        }
    }

    /// Containment check run before every mutation
    fn guard(&self, namespace: &Namespace, grant: &GrantId) -> Result<(), InvariantViolation> {
        let prefix = &self.ctx.config.namespace.prefix;
        match namespace.owned.get(grant) {
            Some(g) if self.ctx.config.namespace.is_managed(&g.name) => Ok(()),
            Some(g) => Err(InvariantViolation::NonNamespacedGrant {
                grant: g.name.clone(),
                prefix: prefix.clone(),
            }),
            None => Err(InvariantViolation::NonNamespacedGrant {
                grant: grant.to_string(),
                prefix: prefix.clone(),
            }),
        }
    }

    async fn namespace(&self, community: &CommunityId) -> Result<(Namespace, Vec<Grant>), CoexError> {
        let config = &self.ctx.config.namespace;
        let grants = self.ctx.reader.list_grants(community).await?;
        let owned: BTreeMap<GrantId, Grant> = grants
            .iter()
            .filter(|g| config.is_managed(&g.name))
            .map(|g| (g.id.clone(), g.clone()))
            .collect();
        let by_tier = config
            .tiers
            .iter()
            .filter_map(|tier| {
                let name = config.grant_name(tier);
                owned
                    .values()
                    .find(|g| g.name == name)
                    .map(|g| (tier.clone(), g.id.clone()))
            })
            .collect();
        Ok((Namespace { owned, by_tier }, grants))
    }

    pub(crate) async fn setup_locked(
        &self,
        state: &CommunityMigrationState,
    ) -> Result<GrantSetup, CoexError> {
        Self::require_authority(state)?;
        let community = &state.community_id;
        let config = &self.ctx.config.namespace;
        let (namespace, grants) = self.namespace(community).await?;

        // Below the incumbent's highest grant, or the highest foreign grant when
        // no profile is known.
        let profile = self.ctx.store.load_profile(community).await?;
        let incumbent_top = grants
            .iter()
            .filter(|g| !config.contains(&g.name))
            .filter(|g| {
                profile
                    .as_ref()
                    .map_or(true, |p| p.suspect_grants.contains_key(&g.name))
            })
            .map(|g| g.position)
            .max()
            .unwrap_or(1);
        let position = incumbent_top.saturating_sub(1).max(0);

        let mut setup = GrantSetup::default();
        for tier in &config.tiers {
            let name = config.grant_name(tier);
            if namespace.by_tier.contains_key(tier) {
                setup.reused.push(name);
                continue;
            }
            let spec = GrantSpec {
                name: name.clone(),
                position,
                permissions: BTreeSet::new(),
            };
            self.ctx.writer.create_grant(community, spec).await?;
            telemetry::record_grant_op("create", true);
            setup.created.push(name);
        }
        info!(
            community = %community,
            created = setup.created.len(),
            reused = setup.reused.len(),
            position,
            "namespaced grants ready"
        );
        Ok(setup)
    }

    pub(crate) async fn sync_locked(
        &self,
        state: &mut CommunityMigrationState,
        lock: &CommunityLock,
    ) -> Result<GrantSyncReport, CoexError> {
        Self::require_authority(state)?;
        debug_assert_eq!(lock.community(), &state.community_id);
        let community = state.community_id.clone();
        let now = self.ctx.now();
        let (mut namespace, _) = self.namespace(&community).await?;
        if namespace.by_tier.len() < self.ctx.config.namespace.tiers.len() {
            // Setup never ran to completion, e.g. the platform failed right
            // after the mode change was saved.
            self.setup_locked(state).await?;
            namespace = self.namespace(&community).await?.0;
        }
        let gradual = state.strategy == Some(MigrationStrategy::Gradual);
        let rollout = if gradual { state.rollout_percent } else { 100 };

        let mut report = GrantSyncReport {
            rollout_percent: rollout,
            ..GrantSyncReport::default()
        };
        let mut sample = AccessSample {
            community_id: community.clone(),
            sampled_at: now,
            members_with_access: 0,
            members_lost_access: 0,
            grants_added: 0,
            grants_removed: 0,
            operation_errors: 0,
            operations: 0,
        };

        for member in self.ctx.reader.list_members(&community).await? {
            if !in_rollout(&member, rollout) {
                report.outside_rollout += 1;
                continue;
            }
            let change = match self.sync_member(&community, &member, &namespace).await {
                Ok(change) => change,
                Err(e) if e.is_invariant_violation() => return Err(e),
                Err(e) => {
                    warn!(community = %community, member = %member, error = %e, "namespaced sync skipped member");
                    MemberChange {
                        errors: 1,
                        ..MemberChange::default()
                    }
                }
            };
            if change.had_access {
                sample.members_with_access += 1;
                if !change.has_access {
                    sample.members_lost_access += 1;
                }
            }
            report.added += change.added;
            report.removed += change.removed;
            report.errors += change.errors;
        }

        sample.grants_added = report.added;
        sample.grants_removed = report.removed;
        sample.operation_errors = report.errors;
        sample.operations = report.added + report.removed + report.errors;
        self.ctx.store.record_access_sample(&sample).await?;

        if gradual {
            let step = self.ctx.config.rollout.gradual_step_percent;
            state.rollout_percent = state.rollout_percent.saturating_add(step).min(100);
        } else {
            state.rollout_percent = 100;
        }
        state.updated_at = now;

        info!(
            community = %community,
            added = report.added,
            removed = report.removed,
            errors = report.errors,
            rollout = report.rollout_percent,
            "namespaced sync complete"
        );
        Ok(report)
    }

    async fn sync_member(
        &self,
        community: &CommunityId,
        member: &MemberId,
        namespace: &Namespace,
    ) -> Result<MemberChange, CoexError> {
        let held: BTreeSet<GrantId> = self
            .ctx
            .reader
            .get_member_grants(community, member)
            .await?
            .into_iter()
            .filter(|id| namespace.owned.contains_key(id))
            .collect();

        let tier = match self.ctx.identities.linked_identity(community, member).await? {
            Some(identity) => self.ctx.eligibility.evaluate(&identity).await?.tier,
            None => None,
        };
        let desired: BTreeSet<GrantId> = tier
            .and_then(|t| namespace.by_tier.get(&t).cloned())
            .into_iter()
            .collect();

        let mut change = MemberChange {
            had_access: !held.is_empty(),
            ..MemberChange::default()
        };
        let mut holding = held.clone();

        for grant in desired.difference(&held) {
            self.guard(namespace, grant)?;
            match self.ctx.writer.add_grant(community, member, grant).await {
                Ok(()) => {
                    change.added += 1;
                    holding.insert(grant.clone());
                    telemetry::record_grant_op("add", true);
                }
                Err(e) => {
                    change.errors += 1;
                    telemetry::record_grant_op("add", false);
                    warn!(community = %community, member = %member, grant = %grant, error = %e, "grant add failed");
                }
            }
        }
        for grant in held.difference(&desired) {
            self.guard(namespace, grant)?;
            match self.ctx.writer.remove_grant(community, member, grant).await {
                Ok(()) => {
                    change.removed += 1;
                    holding.remove(grant);
                    telemetry::record_grant_op("remove", true);
                }
                Err(e) => {
                    change.errors += 1;
                    telemetry::record_grant_op("remove", false);
                    warn!(community = %community, member = %member, grant = %grant, error = %e, "grant remove failed");
                }
            }
        }
        change.has_access = !holding.is_empty();
        if change.added + change.removed > 0 {
            debug!(community = %community, member = %member, added = change.added, removed = change.removed, "member holdings updated");
        }
        Ok(change)
    }
}
