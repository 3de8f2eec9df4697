//! Visibility tracking and delta replication
//!
//! Every tick runs three stages, each internally parallel on the engine's
//! worker pool and separated by a barrier:
//!
//! 1. **Visibility computation** ([`compute`]): one spatial query per observer,
//!    filling the observer's visible set and each entity's [`VisibilityState`].
//! 2. **Update queuing** ([`queuing`]): one task per registered component kind,
//!    turning outdated flags (and newly visible pairs) into per-observer
//!    [`UpdateRecord`]s.
//! 3. **Dispatch** ([`dispatch`]): one task per observer, computing removals,
//!    draining pending updates into a single [`OutgoingMessage`] and handing
//!    the encoded bytes to the observer's sink.
//!
//! [`OutgoingMessage`]: crate::net::codec::OutgoingMessage

pub mod component;
pub mod compute;
pub mod dispatch;
pub mod engine;
pub mod outdated;
pub mod queuing;
pub mod viewer;
pub mod visibility;

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::world::EntityId;

pub use component::{ComponentKind, ComponentRegistry, ComponentReplicator, ComponentStore, UpdateRecord};
pub use engine::{ReplicationEngine, TickReport};
pub use viewer::ViewerState;
pub use visibility::{VisibilityState, VisibilityTable};

/// Identity of an observer (one per connection / controlled entity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub Uuid);

impl ObserverId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer:{}", self.0)
    }
}

/// Errors returned by the replication API.
///
/// All of these are programmer errors caught at the call site; nothing in the
/// per-tick path surfaces an error to callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicationError {
    #[error("Component kind {0:?} is not registered as trackable")]
    UnregisteredComponent(ComponentKind),
    #[error("Component '{0}' is already registered")]
    DuplicateComponent(&'static str),
    #[error("Cannot register component '{0}': all {max} kind ids are taken", max = u16::MAX as usize + 1)]
    TooManyComponents(&'static str),
    #[error("{0} is not present in the spatial index")]
    EntityNotIndexed(EntityId),
    #[error("Unknown {0}")]
    UnknownObserver(ObserverId),
    #[error("{0} is already attached")]
    DuplicateObserver(ObserverId),
    #[error("View radius must be finite and positive, got {0}")]
    InvalidViewRadius(f64),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Failed to build worker pool: {0}")]
    WorkerPool(String),
}

/// Pick the lock shard for an entity. `shard_count` must be a power of two.
#[inline]
pub(crate) fn shard_for(entity: EntityId, shard_count: usize) -> usize {
    let mut hasher = FxHasher::default();
    entity.hash(&mut hasher);
    (hasher.finish() as usize) & (shard_count - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_for_in_range() {
        for i in 0..1000 {
            assert!(shard_for(EntityId(i), 64) < 64);
        }
    }

    #[test]
    fn test_shard_for_is_stable() {
        assert_eq!(shard_for(EntityId(42), 16), shard_for(EntityId(42), 16));
    }

    #[test]
    fn test_shard_for_spreads_entities() {
        let mut used = [false; 16];
        for i in 0..256 {
            used[shard_for(EntityId(i), 16)] = true;
        }
        assert!(used.iter().filter(|u| **u).count() > 8, "Sequential ids should hit most shards");
    }

    #[test]
    fn test_observer_ids_unique() {
        assert_ne!(ObserverId::new(), ObserverId::new());
    }
}
