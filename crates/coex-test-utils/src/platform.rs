//! Recording fake of the community platform

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coex_core::{
    Automation, AutomationId, Channel, CollaboratorError, CommunityId, Grant, GrantId, GrantSpec,
    MemberId, PlatformReader, PlatformWriter,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const SERVICE: &str = "fake-platform";

/// A mutating call observed by the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Add {
        member: MemberId,
        grant: GrantId,
    },
    Remove {
        member: MemberId,
        grant: GrantId,
    },
    Create {
        name: String,
    },
}

#[derive(Debug, Default)]
struct World {
    members: BTreeMap<MemberId, BTreeSet<GrantId>>,
    grants: BTreeMap<GrantId, Grant>,
    channels: Vec<Channel>,
    automations: Vec<Automation>,
    activity: BTreeMap<AutomationId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing_members: BTreeSet<MemberId>,
    slow_members: BTreeMap<MemberId, Duration>,
    failing_writes: BTreeSet<MemberId>,
}

/// In-memory platform that records every mutating call
///
/// One world per community. Incumbent grants created through the fixture
/// helpers get the id `g-<name>`; grants created through
/// [`PlatformWriter::create_grant`] get `created-<n>`.
#[derive(Debug, Default)]
pub struct FakePlatform {
    worlds: Mutex<BTreeMap<CommunityId, World>>,
    faults: Mutex<Faults>,
    mutations: Mutex<Vec<Mutation>>,
    created: Mutex<u32>,
}

impl FakePlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id used for a fixture grant of the given name
    #[must_use]
    pub fn grant_id(name: &str) -> GrantId {
        GrantId::new(format!("g-{name}"))
    }

    /// Builder: add a platform grant
    #[must_use]
    pub fn with_grant(self, community: &CommunityId, name: &str, position: i32) -> Self {
        self.insert_grant(community, name, position);
        self
    }

    /// Builder: add a member holding the named grants (created on demand)
    #[must_use]
    pub fn with_member(self, community: &CommunityId, member: &str, grants: &[&str]) -> Self {
        self.set_member_grants(community, &MemberId::from(member), grants);
        self
    }

    /// Builder: add a channel
    #[must_use]
    pub fn with_channel(self, community: &CommunityId, name: &str) -> Self {
        self.world(community, |w| {
            let id = format!("ch-{}", w.channels.len());
            w.channels.push(Channel {
                id,
                name: name.to_string(),
            });
        });
        self
    }

    /// Builder: add an automation account
    #[must_use]
    pub fn with_automation(self, community: &CommunityId, id: &str, name: &str, online: bool) -> Self {
        self.world(community, |w| {
            w.automations.push(Automation {
                id: AutomationId::from(id),
                name: name.to_string(),
                online,
            });
        });
        self
    }

    /// Builder: record grant activity of an automation
    #[must_use]
    pub fn with_activity(self, community: &CommunityId, automation: &str, at: DateTime<Utc>) -> Self {
        self.set_activity(community, automation, at);
        self
    }

    pub fn insert_grant(&self, community: &CommunityId, name: &str, position: i32) -> GrantId {
        let id = Self::grant_id(name);
        self.world(community, |w| {
            w.grants.entry(id.clone()).or_insert_with(|| Grant {
                id: id.clone(),
                name: name.to_string(),
                position,
                permissions: BTreeSet::new(),
            });
        });
        id
    }

    /// Replace a member's grants with the named ones
    pub fn set_member_grants(&self, community: &CommunityId, member: &MemberId, grants: &[&str]) {
        let ids: BTreeSet<GrantId> = grants
            .iter()
            .map(|name| self.insert_grant(community, name, 1))
            .collect();
        self.world(community, |w| {
            w.members.insert(member.clone(), ids);
        });
    }

    pub fn set_activity(&self, community: &CommunityId, automation: &str, at: DateTime<Utc>) {
        self.world(community, |w| {
            w.activity.insert(AutomationId::from(automation), at);
        });
    }

    pub fn set_automation_online(&self, community: &CommunityId, automation: &str, online: bool) {
        self.world(community, |w| {
            for a in w.automations.iter_mut().filter(|a| a.id.as_str() == automation) {
                a.online = online;
            }
        });
    }

    pub fn remove_automation(&self, community: &CommunityId, automation: &str) {
        self.world(community, |w| w.automations.retain(|a| a.id.as_str() != automation));
    }

    /// Every call fails with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Reads of this member's grants fail
    pub fn fail_member(&self, member: &MemberId) {
        self.faults.lock().failing_members.insert(member.clone());
    }

    /// Reads of this member's grants take `delay`
    pub fn slow_member(&self, member: &MemberId, delay: Duration) {
        self.faults.lock().slow_members.insert(member.clone(), delay);
    }

    /// Add/remove on this member fail
    pub fn fail_writes_for(&self, member: &MemberId) {
        self.faults.lock().failing_writes.insert(member.clone());
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// All mutating calls so far
    #[must_use]
    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().clone()
    }

    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().len()
    }

    /// Names of the grants a member currently holds
    #[must_use]
    pub fn member_grant_names(&self, community: &CommunityId, member: &MemberId) -> BTreeSet<String> {
        self.world(community, |w| {
            w.members
                .get(member)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| w.grants.get(id).map(|g| g.name.clone()))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Grant by name, if present
    #[must_use]
    pub fn grant_by_name(&self, community: &CommunityId, name: &str) -> Option<Grant> {
        self.world(community, |w| w.grants.values().find(|g| g.name == name).cloned())
    }

    fn world<R>(&self, community: &CommunityId, f: impl FnOnce(&mut World) -> R) -> R {
        let mut worlds = self.worlds.lock();
        f(worlds.entry(community.clone()).or_default())
    }

    fn check_available(&self) -> Result<(), CollaboratorError> {
        if self.faults.lock().unavailable {
            return Err(CollaboratorError::unavailable(SERVICE, "injected outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformReader for FakePlatform {
    async fn list_members(&self, community: &CommunityId) -> Result<Vec<MemberId>, CollaboratorError> {
        self.check_available()?;
        Ok(self.world(community, |w| w.members.keys().cloned().collect()))
    }

    async fn get_member_grants(
        &self,
        community: &CommunityId,
        member: &MemberId,
    ) -> Result<Vec<GrantId>, CollaboratorError> {
        self.check_available()?;
        let (failing, delay) = {
            let faults = self.faults.lock();
            (
                faults.failing_members.contains(member),
                faults.slow_members.get(member).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(CollaboratorError::unavailable(SERVICE, format!("member {member}")));
        }
        self.world(community, |w| {
            w.members
                .get(member)
                .map(|ids| ids.iter().cloned().collect())
                .ok_or_else(|| CollaboratorError::NotFound {
                    service: SERVICE.to_string(),
                    what: format!("member {member}"),
                })
        })
    }

    async fn list_grants(&self, community: &CommunityId) -> Result<Vec<Grant>, CollaboratorError> {
        self.check_available()?;
        Ok(self.world(community, |w| w.grants.values().cloned().collect()))
    }

    async fn list_channels(&self, community: &CommunityId) -> Result<Vec<Channel>, CollaboratorError> {
        self.check_available()?;
        Ok(self.world(community, |w| w.channels.clone()))
    }

    async fn list_automations(
        &self,
        community: &CommunityId,
    ) -> Result<Vec<Automation>, CollaboratorError> {
        self.check_available()?;
        Ok(self.world(community, |w| w.automations.clone()))
    }

    async fn latest_grant_activity(
        &self,
        community: &CommunityId,
        automation: &AutomationId,
    ) -> Result<Option<DateTime<Utc>>, CollaboratorError> {
        self.check_available()?;
        Ok(self.world(community, |w| w.activity.get(automation).copied()))
    }
}

#[async_trait]
impl PlatformWriter for FakePlatform {
    async fn add_grant(
        &self,
        community: &CommunityId,
        member: &MemberId,
        grant: &GrantId,
    ) -> Result<(), CollaboratorError> {
        self.mutations.lock().push(Mutation::Add {
            member: member.clone(),
            grant: grant.clone(),
        });
        self.check_available()?;
        if self.faults.lock().failing_writes.contains(member) {
            return Err(CollaboratorError::unavailable(SERVICE, "write rejected"));
        }
        self.world(community, |w| {
            w.members.entry(member.clone()).or_default().insert(grant.clone());
        });
        Ok(())
    }

    async fn remove_grant(
        &self,
        community: &CommunityId,
        member: &MemberId,
        grant: &GrantId,
    ) -> Result<(), CollaboratorError> {
        self.mutations.lock().push(Mutation::Remove {
            member: member.clone(),
            grant: grant.clone(),
        });
        self.check_available()?;
        if self.faults.lock().failing_writes.contains(member) {
            return Err(CollaboratorError::unavailable(SERVICE, "write rejected"));
        }
        self.world(community, |w| {
            if let Some(ids) = w.members.get_mut(member) {
                ids.remove(grant);
            }
        });
        Ok(())
    }

    async fn create_grant(
        &self,
        community: &CommunityId,
        spec: GrantSpec,
    ) -> Result<Grant, CollaboratorError> {
        self.mutations.lock().push(Mutation::Create {
            name: spec.name.clone(),
        });
        self.check_available()?;
        let id = {
            let mut n = self.created.lock();
            *n += 1;
            GrantId::new(format!("created-{n}"))
        };
        let grant = Grant {
            id: id.clone(),
            name: spec.name,
            position: spec.position,
            permissions: spec.permissions,
        };
        self.world(community, |w| {
            w.grants.insert(id, grant.clone());
        });
        Ok(grant)
    }
}
