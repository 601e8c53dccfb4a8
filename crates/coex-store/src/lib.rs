//! Coex Store - persistence contract for the migration engine
//!
//! - [`MigrationStore`]: async storage trait over the data model
//! - [`CommunityLock`]: exclusive per-community lock obtained from the store
//! - [`InMemoryStore`]: DashMap-backed implementation

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod lock;
pub mod memory;
pub mod store;

pub use lock::CommunityLock;
pub use memory::InMemoryStore;
pub use store::MigrationStore;
