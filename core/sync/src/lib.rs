//! Strata Sync Engine
//!
//! Offline-first synchronization of a local node cache with a remote
//! key/value store:
//! - Local cache layer with serialized node updates and change events
//! - Automatic merging of local, remote and common versions
//! - Task collection and bounded-concurrency remote requests
//! - Caching strategies and scope-based access rules
//! - Periodic and on-demand sync scheduling

pub mod access;
pub mod caching;
pub mod config;
pub mod engine;
pub mod events;
pub mod facade;
pub mod integrity;
pub mod local;
pub mod merge;
pub mod scheduler;
pub mod status;
pub mod tasks;

// Re-export main types
pub use access::{Access, AccessMode};
pub use caching::{Caching, CachingStrategy};
pub use config::{Backend, ChangeEventsConfig, SyncConfig};
pub use engine::{SyncReport, Synchronizer};
pub use events::{ChangeEvent, EventBus, FailureKind, Origin, SyncEvent, WireEvent};
pub use facade::{MaxAge, SyncedStore};
pub use local::LocalCache;
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use status::{interpret_status, Interpretation};
pub use tasks::{classify, NodeStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let config = SyncConfig::default();
        assert_eq!(config.num_threads, 10);
        let _access = Access::new();
        let _caching = Caching::new();
        assert_eq!(MaxAge::default(), MaxAge::Default);
    }
}
