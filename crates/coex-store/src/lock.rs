use coex_core::CommunityId;
use std::any::Any;

/// Exclusive per-community lock
///
/// Holding one is the only way to write a `CommunityMigrationState`; the lock
/// is released when the value is dropped. Backends decide what the guard is
/// (an in-process mutex guard, a row lock, a lease).
pub struct CommunityLock {
    community: CommunityId,
    _guard: Box<dyn Any + Send + Sync>,
}

impl CommunityLock {
    /// Wrap a backend guard
    #[inline]
    #[must_use]
    pub fn new(community: CommunityId, guard: impl Any + Send + Sync) -> Self {
        Self {
            community,
            _guard: Box::new(guard),
        }
    }

    /// Community this lock covers
    #[inline]
    #[must_use]
    pub fn community(&self) -> &CommunityId {
        &self.community
    }
}

impl std::fmt::Debug for CommunityLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunityLock")
            .field("community", &self.community)
            .finish_non_exhaustive()
    }
}
