//! Network-outdated side table
//!
//! Keyed by (component kind, entity), each entry counts how many times
//! gameplay marked the component since the last time the update queuing
//! stage consumed it. Marks from any number of threads collapse into one
//! pending entry, so a flag is never lost and never produces two updates in
//! the same tick.

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::replication::component::ComponentKind;
use crate::replication::shard_for;
use crate::world::EntityId;

/// Lock shards per component kind (power of two)
const OUTDATED_SHARDS: usize = 16;

/// Pending marks for one component kind
struct KindFlags {
    shards: Box<[Mutex<HashMap<EntityId, u32>>]>,
}

impl KindFlags {
    fn new() -> Self {
        Self {
            shards: (0..OUTDATED_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    fn shard(&self, entity: EntityId) -> &Mutex<HashMap<EntityId, u32>> {
        &self.shards[shard_for(entity, OUTDATED_SHARDS)]
    }
}

/// (kind, entity) -> pending mark count
#[derive(Default)]
pub struct OutdatedTable {
    kinds: Vec<KindFlags>,
}

impl OutdatedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make room for one more component kind (called on registration)
    pub fn add_kind(&mut self) {
        self.kinds.push(KindFlags::new());
    }

    pub fn kind_count(&self) -> usize {
        self.kinds.len()
    }

    /// Flag a component as changed. Returns the number of marks pending for
    /// it this tick, or `None` if the kind is unknown.
    pub fn mark(&self, kind: ComponentKind, entity: EntityId) -> Option<u32> {
        let flags = self.kinds.get(kind.0 as usize)?;
        let mut shard = flags.shard(entity).lock();
        let count = shard.entry(entity).or_insert(0);
        *count = count.saturating_add(1);
        Some(*count)
    }

    pub fn is_outdated(&self, kind: ComponentKind, entity: EntityId) -> bool {
        self.kinds
            .get(kind.0 as usize)
            .is_some_and(|flags| flags.shard(entity).lock().contains_key(&entity))
    }

    /// Read-and-clear every pending flag of one kind.
    ///
    /// Entities come back sorted so update production is reproducible.
    pub fn take(&self, kind: ComponentKind) -> Vec<EntityId> {
        let Some(flags) = self.kinds.get(kind.0 as usize) else {
            return Vec::new();
        };
        let mut entities = Vec::new();
        for shard in flags.shards.iter() {
            let mut shard = shard.lock();
            entities.extend(shard.drain().map(|(entity, _)| entity));
        }
        entities.sort_unstable();
        entities
    }

    /// Number of entities with a pending flag for `kind`
    pub fn pending(&self, kind: ComponentKind) -> usize {
        self.kinds
            .get(kind.0 as usize)
            .map(|flags| flags.shards.iter().map(|s| s.lock().len()).sum())
            .unwrap_or(0)
    }

    /// Drop every flag for a despawned entity
    pub fn forget(&self, entity: EntityId) {
        for flags in &self.kinds {
            flags.shard(entity).lock().remove(&entity);
        }
    }
}
