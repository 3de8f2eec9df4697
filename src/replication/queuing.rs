//! Update queuing stage
//!
//! One task per registered component kind. Each task drains its kind's
//! outdated flags and fans the resulting payloads out to every observer that
//! sees the entity this tick: a full snapshot for observers that just started
//! seeing it, a delta (or a full snapshot when the kind has no delta) for
//! the rest. Entities that became visible to someone without being outdated
//! still get a full snapshot for those newcomers.
//!
//! Payloads are produced at most once per (entity, kind) and cloned per
//! observer, so each observer owns its records.

use hashbrown::HashMap;
use rayon::prelude::*;
use tracing::trace;

use crate::replication::component::{RegisteredComponent, UpdateRecord};
use crate::replication::outdated::OutdatedTable;
use crate::replication::viewer::{QueueOutcome, ViewerState};
use crate::replication::visibility::VisibilityTable;
use crate::replication::{ComponentRegistry, ObserverId};
use crate::world::EntityId;

/// Counts produced by one queuing pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Outdated (entity, kind) flags consumed
    pub outdated_entities: usize,
    pub full_snapshots: usize,
    pub deltas: usize,
    /// Updates that overwrote one already pending for the same key
    pub replaced: usize,
    /// Updates refused because the observer's pending cap was hit
    pub overflowed: usize,
}

impl QueueStats {
    fn merge(self, other: Self) -> Self {
        Self {
            outdated_entities: self.outdated_entities + other.outdated_entities,
            full_snapshots: self.full_snapshots + other.full_snapshots,
            deltas: self.deltas + other.deltas,
            replaced: self.replaced + other.replaced,
            overflowed: self.overflowed + other.overflowed,
        }
    }

    fn count(&mut self, is_full: bool, outcome: QueueOutcome) {
        match outcome {
            QueueOutcome::Overflowed => self.overflowed += 1,
            QueueOutcome::Replaced => self.replaced += 1,
            QueueOutcome::Queued => {}
        }
        if outcome != QueueOutcome::Overflowed {
            if is_full {
                self.full_snapshots += 1;
            } else {
                self.deltas += 1;
            }
        }
    }
}

/// Lazily produced payloads for one (entity, kind)
struct PayloadCache<'a> {
    component: &'a RegisteredComponent,
    entity: EntityId,
    snapshot: Option<Option<Vec<u8>>>,
    delta: Option<Option<Vec<u8>>>,
}

impl<'a> PayloadCache<'a> {
    fn new(component: &'a RegisteredComponent, entity: EntityId) -> Self {
        Self {
            component,
            entity,
            snapshot: None,
            delta: None,
        }
    }

    fn full(&mut self) -> Option<UpdateRecord> {
        let (component, entity) = (self.component, self.entity);
        let data = self
            .snapshot
            .get_or_insert_with(|| component.replicator.snapshot(entity))
            .clone()?;
        Some(UpdateRecord::FullSnapshot { kind: component.kind, data })
    }

    fn delta_or_full(&mut self) -> Option<UpdateRecord> {
        let (component, entity) = (self.component, self.entity);
        let delta = self
            .delta
            .get_or_insert_with(|| component.replicator.delta(entity))
            .clone();
        match delta {
            Some(payload) => Some(UpdateRecord::Delta { kind: component.kind, payload }),
            None => self.full(),
        }
    }
}

/// Run the queuing stage for every registered component kind.
///
/// `newcomers` lists the entities with at least one newly-visible observer
/// this tick, sorted. Must be called inside the engine's worker pool, after
/// visibility computation has finished.
pub fn queue_updates(
    registry: &ComponentRegistry,
    outdated: &OutdatedTable,
    table: &VisibilityTable,
    observers: &HashMap<ObserverId, ViewerState>,
    newcomers: &[EntityId],
) -> QueueStats {
    registry
        .entries()
        .par_iter()
        .map(|component| queue_component(component, outdated, table, observers, newcomers))
        .reduce(QueueStats::default, QueueStats::merge)
}

/// Queue every update one component kind owes this tick
pub fn queue_component(
    component: &RegisteredComponent,
    outdated: &OutdatedTable,
    table: &VisibilityTable,
    observers: &HashMap<ObserverId, ViewerState>,
    newcomers: &[EntityId],
) -> QueueStats {
    let mut stats = QueueStats::default();

    // Flags are consumed even when nobody sees the entity
    let changed = outdated.take(component.kind);
    stats.outdated_entities = changed.len();

    for &entity in &changed {
        let targets = table.observers_of(entity);
        if targets.is_empty() {
            continue;
        }

        let mut payloads = PayloadCache::new(component, entity);
        for (observer, newly) in targets {
            let Some(viewer) = observers.get(&observer) else {
                continue;
            };
            let record = if newly {
                payloads.full()
            } else {
                payloads.delta_or_full()
            };
            let Some(record) = record else {
                continue;
            };
            let is_full = record.is_full_snapshot();
            stats.count(is_full, viewer.queue_update(entity, record));
        }
    }

    // Newly visible but unchanged: newcomers still need the full state
    for &entity in newcomers {
        if changed.binary_search(&entity).is_ok() {
            continue;
        }

        let mut payloads = PayloadCache::new(component, entity);
        for observer in table.newcomers_of(entity) {
            let Some(viewer) = observers.get(&observer) else {
                continue;
            };
            let Some(record) = payloads.full() else {
                break;
            };
            stats.count(true, viewer.queue_update(entity, record));
        }
    }

    trace!(
        "Queued '{}': {} outdated, {} full, {} deltas",
        component.name,
        stats.outdated_entities,
        stats.full_snapshots,
        stats.deltas
    );

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::replication::component::{ComponentKind, ComponentReplicator};

    /// Replicator that counts how often it is asked for payloads
    #[derive(Default)]
    struct Counting {
        snapshots: AtomicUsize,
        deltas: AtomicUsize,
        with_delta: bool,
    }

    impl ComponentReplicator for Counting {
        fn snapshot(&self, entity: EntityId) -> Option<Vec<u8>> {
            self.snapshots.fetch_add(1, Ordering::Relaxed);
            (entity.0 != 999).then(|| vec![entity.0 as u8, 0xFF])
        }

        fn delta(&self, entity: EntityId) -> Option<Vec<u8>> {
            self.deltas.fetch_add(1, Ordering::Relaxed);
            self.with_delta.then(|| vec![entity.0 as u8])
        }
    }

    struct Fixture {
        registry: ComponentRegistry,
        outdated: OutdatedTable,
        table: VisibilityTable,
        observers: HashMap<ObserverId, ViewerState>,
        counter: Arc<Counting>,
    }

    impl Fixture {
        fn new(with_delta: bool, observer_count: usize) -> Self {
            let counter = Arc::new(Counting {
                with_delta,
                ..Default::default()
            });
            let mut registry = ComponentRegistry::new();
            registry.register("health", counter.clone()).unwrap();
            let mut outdated = OutdatedTable::new();
            outdated.add_kind();

            let observers = (0..observer_count)
                .map(|i| {
                    let v = ViewerState::new(ObserverId::new(), EntityId(1000 + i as u64), 10.0, 64, None);
                    (v.id(), v)
                })
                .collect();

            Self {
                registry,
                outdated,
                table: VisibilityTable::new(),
                observers,
                counter,
            }
        }

        fn ids(&self) -> Vec<ObserverId> {
            let mut ids: Vec<_> = self.observers.keys().copied().collect();
            ids.sort();
            ids
        }

        fn see(&self, entity: EntityId, observer: ObserverId) {
            self.table.mark_visible(entity, observer, 0, false);
        }

        fn run(&self) -> QueueStats {
            let newcomers = self.table.entities_with_newcomers();
            queue_updates(&self.registry, &self.outdated, &self.table, &self.observers, &newcomers)
        }

        fn drain(&mut self, observer: ObserverId) -> Vec<UpdateRecord> {
            let viewer = self.observers.get_mut(&observer).unwrap();
            viewer.drain_and_dispatch(0).updates.into_iter().map(|u| u.record).collect()
        }
    }

    #[test]
    fn test_newly_visible_gets_full_snapshot_without_outdated() {
        let mut f = Fixture::new(true, 1);
        let o = f.ids()[0];
        f.table.begin_tick();
        f.see(EntityId(1), o);

        let stats = f.run();
        assert_eq!(stats.full_snapshots, 1);
        assert_eq!(stats.outdated_entities, 0);
        assert_eq!(
            f.drain(o),
            vec![UpdateRecord::FullSnapshot { kind: ComponentKind(0), data: vec![1, 0xFF] }]
        );
    }

    #[test]
    fn test_still_visible_outdated_gets_delta() {
        let mut f = Fixture::new(true, 1);
        let o = f.ids()[0];
        f.table.begin_tick();
        f.see(EntityId(1), o);
        f.run();
        f.drain(o);

        f.table.begin_tick();
        f.see(EntityId(1), o);
        f.outdated.mark(ComponentKind(0), EntityId(1));
        let stats = f.run();

        assert_eq!(stats.deltas, 1);
        assert_eq!(f.drain(o), vec![UpdateRecord::Delta { kind: ComponentKind(0), payload: vec![1] }]);
    }

    #[test]
    fn test_kind_without_delta_falls_back_to_full() {
        let mut f = Fixture::new(false, 1);
        let o = f.ids()[0];
        f.table.begin_tick();
        f.see(EntityId(1), o);
        f.run();
        f.drain(o);

        f.table.begin_tick();
        f.see(EntityId(1), o);
        f.outdated.mark(ComponentKind(0), EntityId(1));
        let stats = f.run();

        assert_eq!(stats.full_snapshots, 1);
        assert_eq!(stats.deltas, 0);
    }

    #[test]
    fn test_mixed_observers_share_payloads() {
        let mut f = Fixture::new(true, 3);
        let ids = f.ids();
        f.table.begin_tick();
        f.see(EntityId(1), ids[0]);
        f.see(EntityId(1), ids[1]);
        f.run();
        f.drain(ids[0]);
        f.drain(ids[1]);
        let snapshots_before = f.counter.snapshots.load(Ordering::Relaxed);

        // ids[0] and ids[1] keep seeing it, ids[2] starts seeing it
        f.table.begin_tick();
        for &o in &ids {
            f.see(EntityId(1), o);
        }
        f.outdated.mark(ComponentKind(0), EntityId(1));
        let stats = f.run();

        assert_eq!(stats.deltas, 2);
        assert_eq!(stats.full_snapshots, 1);
        assert_eq!(f.counter.deltas.load(Ordering::Relaxed), 1, "Delta produced once");
        assert_eq!(
            f.counter.snapshots.load(Ordering::Relaxed) - snapshots_before,
            1,
            "Snapshot produced once for the newcomer"
        );
        assert!(f.drain(ids[2])[0].is_full_snapshot());
    }

    #[test]
    fn test_unobserved_outdated_flag_consumed() {
        let f = Fixture::new(true, 1);
        f.table.begin_tick();
        f.outdated.mark(ComponentKind(0), EntityId(5));

        let stats = f.run();
        assert_eq!(stats.outdated_entities, 1);
        assert_eq!(stats.full_snapshots + stats.deltas, 0);
        assert_eq!(f.outdated.pending(ComponentKind(0)), 0);
    }

    #[test]
    fn test_missing_component_skipped() {
        let mut f = Fixture::new(true, 1);
        let o = f.ids()[0];
        f.table.begin_tick();
        f.see(EntityId(999), o);

        let stats = f.run();
        assert_eq!(stats.full_snapshots, 0);
        assert!(f.drain(o).is_empty());
    }

    #[test]
    fn test_overflow_counted() {
        let mut f = Fixture::new(true, 0);
        let v = ViewerState::new(ObserverId::new(), EntityId(500), 10.0, 1, None);
        let o = v.id();
        f.observers.insert(o, v);

        f.table.begin_tick();
        f.see(EntityId(1), o);
        f.see(EntityId(2), o);
        let stats = f.run();

        assert_eq!(stats.full_snapshots, 1);
        assert_eq!(stats.overflowed, 1);
        assert!(f.observers[&o].is_overflowed());
    }
}
