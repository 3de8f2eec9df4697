//! World-side collaborators of the replication core: entity identity and
//! the spatial proximity index.

pub mod spatial;

use serde::{Deserialize, Serialize};

/// Stable identity of a replicated entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}
