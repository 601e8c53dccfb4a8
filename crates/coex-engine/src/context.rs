//! Shared handles every component is built from

use coex_core::{
    AlertSink, Clock, EligibilityProvider, IdentityResolver, MigrationConfig, PlatformClient,
    PlatformReader, PlatformWriter, SystemClock,
};
use coex_store::MigrationStore;
use std::sync::Arc;

/// Collaborators, store, clock and configuration
///
/// Cloning is cheap. The platform is held as two halves so components that
/// must not mutate (profiler, shadow ledger, health monitor) only ever see
/// the reader.
#[derive(Clone)]
pub struct EngineContext {
    pub(crate) store: Arc<dyn MigrationStore>,
    pub(crate) reader: Arc<dyn PlatformReader>,
    pub(crate) writer: Arc<dyn PlatformWriter>,
    pub(crate) eligibility: Arc<dyn EligibilityProvider>,
    pub(crate) identities: Arc<dyn IdentityResolver>,
    pub(crate) alerts: Arc<dyn AlertSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: Arc<MigrationConfig>,
}

impl EngineContext {
    /// Context with the wall clock and default configuration
    pub fn new<P>(
        store: Arc<dyn MigrationStore>,
        platform: Arc<P>,
        eligibility: Arc<dyn EligibilityProvider>,
        identities: Arc<dyn IdentityResolver>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self
    where
        P: PlatformClient + 'static,
    {
        let reader: Arc<dyn PlatformReader> = platform.clone();
        let writer: Arc<dyn PlatformWriter> = platform;
        Self {
            store,
            reader,
            writer,
            eligibility,
            identities,
            alerts,
            clock: Arc::new(SystemClock),
            config: Arc::new(MigrationConfig::default()),
        }
    }

    /// With a custom clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// With configuration
    #[must_use]
    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MigrationStore> {
        &self.store
    }

    #[inline]
    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
