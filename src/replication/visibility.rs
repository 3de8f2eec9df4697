//! Per-entity visibility state
//!
//! Each entity that is (or recently was) inside some observer's view carries
//! a [`VisibilityState`]: who sees it this tick, who saw it last tick, and who
//! started seeing it this tick. The two observer maps are double-buffered and
//! swapped by flipping an index, so no map is reallocated per tick.
//!
//! States live in a [`VisibilityTable`] sharded by entity hash. Several
//! observer tasks mark the same entity concurrently during visibility
//! computation; each only locks the entity's shard.

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::replication::shard_for;
use crate::replication::ObserverId;
use crate::world::EntityId;

/// Lock shards for the visibility table (power of two)
const VISIBILITY_SHARDS: usize = 64;

/// Per-pair flags recorded alongside each observer
pub type ViewerFlags = u8;

pub mod viewer_flags {
    use super::ViewerFlags;

    /// The entity is the observer's own host entity
    pub const HOST: ViewerFlags = 1 << 0;
    /// The pair was forced back to newly-visible by an observer resync
    pub const RESYNC: ViewerFlags = 1 << 1;
}

/// Observers seeing an entity this tick, with whether each one is new
pub type ObserverList = SmallVec<[(ObserverId, bool); 8]>;

// ============================================================================
// Visibility State
// ============================================================================

/// Double-buffered observer sets for one entity
#[derive(Debug, Default)]
pub struct VisibilityState {
    buffers: [HashMap<ObserverId, ViewerFlags>; 2],
    /// Index of the buffer holding this tick's observers
    current: usize,
    newly_visible_to: HashSet<ObserverId>,
}

impl VisibilityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Roll to a new tick: last tick's `visible_to` becomes
    /// `previously_visible_to` and the other buffer is cleared for reuse.
    pub fn begin_tick(&mut self) {
        self.current ^= 1;
        self.buffers[self.current].clear();
        self.newly_visible_to.clear();
    }

    /// Record that `observer` sees this entity this tick.
    ///
    /// Idempotent and order-independent. `force_new` treats the pair as newly
    /// visible even if the observer saw the entity last tick. Returns whether
    /// the pair is newly visible.
    pub fn mark_visible(&mut self, observer: ObserverId, flags: ViewerFlags, force_new: bool) -> bool {
        let previous = &self.buffers[self.current ^ 1];
        let newly = force_new || !previous.contains_key(&observer);
        let flags = if force_new { flags | viewer_flags::RESYNC } else { flags };

        *self.buffers[self.current].entry(observer).or_insert(0) |= flags;
        if newly {
            self.newly_visible_to.insert(observer);
        }
        self.newly_visible_to.contains(&observer)
    }

    #[inline]
    pub fn visible_to(&self) -> &HashMap<ObserverId, ViewerFlags> {
        &self.buffers[self.current]
    }

    #[inline]
    pub fn previously_visible_to(&self) -> &HashMap<ObserverId, ViewerFlags> {
        &self.buffers[self.current ^ 1]
    }

    #[inline]
    pub fn newly_visible_to(&self) -> &HashSet<ObserverId> {
        &self.newly_visible_to
    }

    #[inline]
    pub fn is_newly_visible(&self, observer: ObserverId) -> bool {
        self.newly_visible_to.contains(&observer)
    }

    /// Seen last tick and this tick (and not forced back to newly visible)
    #[inline]
    pub fn is_still_visible(&self, observer: ObserverId) -> bool {
        self.visible_to().contains_key(&observer) && !self.newly_visible_to.contains(&observer)
    }

    /// True once nobody has seen the entity for a full tick; the record can
    /// then be dropped.
    pub fn gc_if_empty(&self) -> bool {
        self.buffers[0].is_empty() && self.buffers[1].is_empty() && self.newly_visible_to.is_empty()
    }

    /// This tick's observers, each tagged with whether it is new
    pub fn observers(&self) -> ObserverList {
        self.visible_to()
            .keys()
            .map(|&observer| (observer, self.newly_visible_to.contains(&observer)))
            .collect()
    }
}

// ============================================================================
// Visibility Table
// ============================================================================

/// Sharded map of entity -> [`VisibilityState`]
pub struct VisibilityTable {
    shards: Box<[Mutex<HashMap<EntityId, VisibilityState>>]>,
}

impl VisibilityTable {
    pub fn new() -> Self {
        Self {
            shards: (0..VISIBILITY_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    fn shard(&self, entity: EntityId) -> &Mutex<HashMap<EntityId, VisibilityState>> {
        &self.shards[shard_for(entity, VISIBILITY_SHARDS)]
    }

    /// Flip every state to the new tick. Runs once per tick before any
    /// `mark_visible`; shards are processed in parallel on the current pool.
    pub fn begin_tick(&self) {
        self.shards.par_iter().for_each(|shard| {
            for state in shard.lock().values_mut() {
                state.begin_tick();
            }
        });
    }

    /// Record that `observer` sees `entity`, attaching a state on first sight
    pub fn mark_visible(
        &self,
        entity: EntityId,
        observer: ObserverId,
        flags: ViewerFlags,
        force_new: bool,
    ) -> bool {
        self.shard(entity)
            .lock()
            .entry(entity)
            .or_default()
            .mark_visible(observer, flags, force_new)
    }

    /// Drop states nobody has seen for a full tick. Returns how many were dropped.
    pub fn collect_garbage(&self) -> usize {
        self.shards
            .par_iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let before = shard.len();
                shard.retain(|_, state| !state.gc_if_empty());
                before - shard.len()
            })
            .sum()
    }

    /// Run `f` against an entity's state, if it has one
    pub fn with_state<R>(&self, entity: EntityId, f: impl FnOnce(&VisibilityState) -> R) -> Option<R> {
        self.shard(entity).lock().get(&entity).map(f)
    }

    /// This tick's observers of `entity` (empty if untracked)
    pub fn observers_of(&self, entity: EntityId) -> ObserverList {
        self.with_state(entity, VisibilityState::observers).unwrap_or_default()
    }

    /// Observers that started seeing `entity` this tick
    pub fn newcomers_of(&self, entity: EntityId) -> SmallVec<[ObserverId; 8]> {
        self.with_state(entity, |state| state.newly_visible_to().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Entities with at least one newly-visible observer this tick, sorted
    pub fn entities_with_newcomers(&self) -> Vec<EntityId> {
        let mut entities: Vec<EntityId> = self
            .shards
            .par_iter()
            .flat_map_iter(|shard| {
                shard
                    .lock()
                    .iter()
                    .filter(|(_, state)| !state.newly_visible_to().is_empty())
                    .map(|(entity, _)| *entity)
                    .collect::<Vec<_>>()
            })
            .collect();
        entities.par_sort_unstable();
        entities
    }

    /// Total observer/entity pairs visible this tick
    pub fn visible_pairs(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().values().map(|s| s.visible_to().len()).sum::<usize>())
            .sum()
    }

    /// Detach the state of a despawned entity
    pub fn forget(&self, entity: EntityId) -> bool {
        self.shard(entity).lock().remove(&entity).is_some()
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.shard(entity).lock().contains_key(&entity)
    }

    /// Number of entities carrying a visibility state
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VisibilityTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_sight_is_newly_visible() {
        let mut state = VisibilityState::new();
        let observer = ObserverId::new();

        state.begin_tick();
        assert!(state.mark_visible(observer, 0, false));
        assert!(state.is_newly_visible(observer));
        assert!(!state.is_still_visible(observer));
    }

    #[test]
    fn test_second_tick_is_still_visible() {
        let mut state = VisibilityState::new();
        let observer = ObserverId::new();

        state.begin_tick();
        state.mark_visible(observer, 0, false);
        state.begin_tick();
        assert!(!state.mark_visible(observer, 0, false));

        assert!(state.is_still_visible(observer));
        assert!(!state.is_newly_visible(observer));
        assert!(state.previously_visible_to().contains_key(&observer));
    }

    #[test]
    fn test_begin_tick_clears_current_buffer() {
        let mut state = VisibilityState::new();
        let observer = ObserverId::new();

        state.begin_tick();
        state.mark_visible(observer, 0, false);
        state.begin_tick();

        assert!(state.visible_to().is_empty(), "No stale entries after the flip");
        assert!(state.newly_visible_to().is_empty());
        assert_eq!(state.previously_visible_to().len(), 1);
    }

    #[test]
    fn test_mark_visible_idempotent() {
        let observer = ObserverId::new();
        let mut once = VisibilityState::new();
        let mut twice = VisibilityState::new();

        once.begin_tick();
        twice.begin_tick();
        once.mark_visible(observer, 0, false);
        twice.mark_visible(observer, 0, false);
        twice.mark_visible(observer, 0, false);

        assert_eq!(once.visible_to(), twice.visible_to());
        assert_eq!(once.newly_visible_to(), twice.newly_visible_to());
    }

    #[test]
    fn test_force_new_overrides_history() {
        let mut state = VisibilityState::new();
        let observer = ObserverId::new();

        state.begin_tick();
        state.mark_visible(observer, 0, false);
        state.begin_tick();
        assert!(state.mark_visible(observer, 0, true));

        assert!(state.is_newly_visible(observer));
        assert!(!state.is_still_visible(observer));
        assert_eq!(state.visible_to()[&observer] & viewer_flags::RESYNC, viewer_flags::RESYNC);
    }

    #[test]
    fn test_flags_accumulate() {
        let mut state = VisibilityState::new();
        let observer = ObserverId::new();

        state.begin_tick();
        state.mark_visible(observer, viewer_flags::HOST, false);
        state.mark_visible(observer, 0, false);

        assert_eq!(state.visible_to()[&observer], viewer_flags::HOST);
    }

    #[test]
    fn test_gc_after_full_empty_tick() {
        let mut state = VisibilityState::new();
        let observer = ObserverId::new();

        state.begin_tick();
        state.mark_visible(observer, 0, false);
        assert!(!state.gc_if_empty());

        // Nobody sees it this tick, but it was seen last tick
        state.begin_tick();
        assert!(!state.gc_if_empty(), "Still needed to compute the departure");

        // Empty for a full tick
        state.begin_tick();
        assert!(state.gc_if_empty());
    }

    #[test]
    fn test_table_mark_attaches_lazily() {
        let table = VisibilityTable::new();
        let observer = ObserverId::new();

        assert!(!table.contains(EntityId(1)));
        table.begin_tick();
        assert!(table.mark_visible(EntityId(1), observer, 0, false));

        assert!(table.contains(EntityId(1)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.observers_of(EntityId(1)).as_slice(), &[(observer, true)]);
    }

    #[test]
    fn test_table_garbage_collection() {
        let table = VisibilityTable::new();
        let observer = ObserverId::new();

        table.begin_tick();
        table.mark_visible(EntityId(1), observer, 0, false);
        table.mark_visible(EntityId(2), observer, 0, false);
        assert_eq!(table.collect_garbage(), 0);

        // Entity 1 leaves view
        table.begin_tick();
        table.mark_visible(EntityId(2), observer, 0, false);
        assert_eq!(table.collect_garbage(), 0);

        table.begin_tick();
        table.mark_visible(EntityId(2), observer, 0, false);
        assert_eq!(table.collect_garbage(), 1);
        assert!(!table.contains(EntityId(1)));
        assert!(table.contains(EntityId(2)));
    }

    #[test]
    fn test_table_entities_with_newcomers() {
        let table = VisibilityTable::new();
        let a = ObserverId::new();
        let b = ObserverId::new();

        table.begin_tick();
        table.mark_visible(EntityId(1), a, 0, false);
        table.begin_tick();
        table.mark_visible(EntityId(1), a, 0, false);
        table.mark_visible(EntityId(2), a, 0, false);
        table.mark_visible(EntityId(1), b, 0, false);

        assert_eq!(table.entities_with_newcomers(), vec![EntityId(1), EntityId(2)]);
        assert_eq!(table.newcomers_of(EntityId(1)).as_slice(), &[b]);
        assert_eq!(table.visible_pairs(), 3);
    }

    #[test]
    fn test_table_concurrent_marks() {
        let table = Arc::new(VisibilityTable::new());
        let observers: Vec<ObserverId> = (0..8).map(|_| ObserverId::new()).collect();
        table.begin_tick();

        let handles: Vec<_> = observers
            .iter()
            .map(|&observer| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for e in 0..200 {
                        table.mark_visible(EntityId(e), observer, 0, false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for e in 0..200 {
            assert_eq!(table.observers_of(EntityId(e)).len(), 8, "Entity {} lost a writer", e);
        }
    }

    #[test]
    fn test_table_forget() {
        let table = VisibilityTable::new();
        table.begin_tick();
        table.mark_visible(EntityId(4), ObserverId::new(), 0, false);

        assert!(table.forget(EntityId(4)));
        assert!(!table.forget(EntityId(4)));
        assert!(table.is_empty());
    }
}
