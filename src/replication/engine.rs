//! Replication engine
//!
//! Owns every piece of per-tick state and drives the three stages on a
//! fixed-size rayon pool. Each stage is one `pool.install` call, so a stage
//! returns only after all of its parallel work is done; that return is the
//! barrier the next stage relies on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, info, trace, warn};

use crate::config::ReplicationConfig;
use crate::metrics::ReplicationMetrics;
use crate::net::codec::{BincodeCodec, OutgoingMessage, WireCodec};
use crate::net::sink::NetworkSink;
use crate::replication::component::{ComponentKind, ComponentRegistry, ComponentReplicator};
use crate::replication::compute::{compute_visibility, ComputeStats};
use crate::replication::dispatch::{dispatch_all, DispatchStats};
use crate::replication::outdated::OutdatedTable;
use crate::replication::queuing::{queue_updates, QueueStats};
use crate::replication::viewer::ViewerState;
use crate::replication::visibility::VisibilityTable;
use crate::replication::{ObserverId, ReplicationError};
use crate::world::spatial::{SpatialGrid, SpatialIndex};
use crate::world::EntityId;

/// What one call to [`ReplicationEngine::run_tick`] did
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    /// Observers active during the tick (after pruning)
    pub observers: usize,
    /// Entities carrying a visibility record at the end of the tick
    pub tracked_entities: usize,
    /// Observers removed at the start of the tick
    pub pruned: usize,
    pub compute: ComputeStats,
    pub queue: QueueStats,
    pub dispatch: DispatchStats,
    pub visibility_time: Duration,
    pub queuing_time: Duration,
    pub dispatch_time: Duration,
    pub total_time: Duration,
}

/// Per-tick visibility and delta-replication engine
pub struct ReplicationEngine<S: SpatialIndex = SpatialGrid> {
    config: ReplicationConfig,
    world: S,
    registry: ComponentRegistry,
    outdated: OutdatedTable,
    visibility: VisibilityTable,
    observers: HashMap<ObserverId, ViewerState>,
    codec: Arc<dyn WireCodec>,
    pool: rayon::ThreadPool,
    metrics: Arc<ReplicationMetrics>,
    tick: u64,
}

impl<S: SpatialIndex> ReplicationEngine<S> {
    /// Create an engine over `world` with its own worker pool
    pub fn new(config: ReplicationConfig, world: S) -> Result<Self, ReplicationError> {
        config.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("viewcast-worker-{}", i))
            .build()
            .map_err(|e| ReplicationError::WorkerPool(e.to_string()))?;

        info!(
            "Replication engine ready: {} workers, {} Hz, self_visibility={}, heartbeat={}",
            config.worker_threads, config.tick_rate, config.self_visibility, config.heartbeat
        );

        Ok(Self {
            config,
            world,
            registry: ComponentRegistry::new(),
            outdated: OutdatedTable::new(),
            visibility: VisibilityTable::new(),
            observers: HashMap::new(),
            codec: Arc::new(BincodeCodec::new()),
            pool,
            metrics: Arc::new(ReplicationMetrics::new()),
            tick: 0,
        })
    }

    /// Replace the wire codec (bincode by default)
    pub fn with_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Report into a shared metrics registry
    pub fn with_metrics(mut self, metrics: Arc<ReplicationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<ReplicationMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn world(&self) -> &S {
        &self.world
    }

    /// Mutable access for gameplay to move, spawn and remove entities
    /// between ticks
    pub fn world_mut(&mut self) -> &mut S {
        &mut self.world
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a trackable component kind
    pub fn register_component(
        &mut self,
        name: &'static str,
        replicator: Arc<dyn ComponentReplicator>,
    ) -> Result<ComponentKind, ReplicationError> {
        let kind = self.registry.register(name, replicator)?;
        self.outdated.add_kind();
        debug!("Registered component '{}' as {:?}", name, kind);
        Ok(kind)
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Flag a component as changed. Picked up by the next tick's queuing
    /// stage; marking several times before then collapses to one update.
    pub fn mark_outdated(&self, entity: EntityId, kind: ComponentKind) -> Result<(), ReplicationError> {
        if !self.registry.contains(kind) {
            return Err(ReplicationError::UnregisteredComponent(kind));
        }
        if !self.world.contains(entity) {
            return Err(ReplicationError::EntityNotIndexed(entity));
        }
        self.outdated.mark(kind, entity);
        Ok(())
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Attach an observer to `host` with a fresh id
    pub fn attach_observer(
        &mut self,
        host: EntityId,
        view_radius: f64,
        sink: Option<Box<dyn NetworkSink>>,
    ) -> Result<ObserverId, ReplicationError> {
        self.attach_observer_with_id(ObserverId::new(), host, view_radius, sink)
    }

    /// Attach an observer under a caller-chosen id (e.g. a session id)
    pub fn attach_observer_with_id(
        &mut self,
        id: ObserverId,
        host: EntityId,
        view_radius: f64,
        sink: Option<Box<dyn NetworkSink>>,
    ) -> Result<ObserverId, ReplicationError> {
        if !view_radius.is_finite() || view_radius <= 0.0 {
            return Err(ReplicationError::InvalidViewRadius(view_radius));
        }
        if !self.world.contains(host) {
            return Err(ReplicationError::EntityNotIndexed(host));
        }
        if self.observers.contains_key(&id) {
            return Err(ReplicationError::DuplicateObserver(id));
        }

        let viewer = ViewerState::new(id, host, view_radius, self.config.max_pending_updates, sink);
        self.observers.insert(id, viewer);
        info!("Attached {} to {} (radius {:.1})", id, host, view_radius);
        Ok(id)
    }

    /// Release an observer, first telling its client to drop everything it
    /// was sent
    pub fn detach_observer(&mut self, id: ObserverId) -> Result<(), ReplicationError> {
        let viewer = self
            .observers
            .remove(&id)
            .ok_or(ReplicationError::UnknownObserver(id))?;

        let mut removals: Vec<EntityId> = viewer.sent_last_tick().iter().copied().collect();
        if let Some(sink) = viewer.sink().filter(|_| !removals.is_empty()) {
            removals.sort_unstable();
            let message = OutgoingMessage {
                tick: self.tick,
                removals,
                ..Default::default()
            };
            match self.codec.encode_message(&message) {
                Ok(bytes) => {
                    if let Err(e) = sink.send(bytes) {
                        debug!("Final removal message for {} not delivered: {}", id, e);
                    }
                }
                Err(e) => warn!("Failed to encode final removal message for {}: {}", id, e),
            }
        }

        info!("Detached {}", id);
        Ok(())
    }

    /// Drop an entity's outdated flags and visibility record immediately.
    /// Observers that saw it get a removal on the next dispatch.
    pub fn forget_entity(&self, entity: EntityId) {
        self.outdated.forget(entity);
        self.visibility.forget(entity);
    }

    fn prune_observers(&mut self) -> usize {
        let before = self.observers.len();
        self.observers.retain(|id, viewer| {
            if viewer.should_prune() {
                info!(
                    "Pruning {} (disconnected={}, host_lost={})",
                    id,
                    viewer.is_disconnected(),
                    viewer.is_host_lost()
                );
                false
            } else {
                true
            }
        });
        before - self.observers.len()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn has_observer(&self, id: ObserverId) -> bool {
        self.observers.contains_key(&id)
    }

    /// Entities currently carrying a visibility record
    pub fn tracked_entity_count(&self) -> usize {
        self.visibility.len()
    }

    /// Observers that see `entity` this tick, sorted
    pub fn visible_to(&self, entity: EntityId) -> Vec<ObserverId> {
        let mut observers = self
            .visibility
            .with_state(entity, |state| state.visible_to().keys().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        observers.sort_unstable();
        observers
    }

    /// What `observer` sees this tick, sorted
    pub fn currently_visible(&self, observer: ObserverId) -> Option<Vec<EntityId>> {
        let viewer = self.observers.get(&observer)?;
        let mut entities: Vec<EntityId> = viewer.currently_visible().iter().copied().collect();
        entities.sort_unstable();
        Some(entities)
    }

    /// Number of the last completed tick
    pub fn tick(&self) -> u64 {
        self.tick
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one tick: prune, compute visibility, queue updates, dispatch
    pub fn run_tick(&mut self) -> TickReport {
        let tick_start = Instant::now();
        self.tick += 1;
        let tick = self.tick;
        let pruned = self.prune_observers();

        let include_self = self.config.self_visibility;
        let heartbeat = self.config.heartbeat;
        let pool = &self.pool;
        let world = &self.world;
        let registry = &self.registry;
        let outdated = &self.outdated;
        let table = &self.visibility;
        let codec = self.codec.as_ref();
        let observers = &mut self.observers;

        let stage_start = Instant::now();
        let compute = pool.install(|| compute_visibility(observers, table, world, include_self));
        let visibility_time = stage_start.elapsed();

        let stage_start = Instant::now();
        let queue = pool.install(|| {
            let newcomers = table.entities_with_newcomers();
            queue_updates(registry, outdated, table, observers, &newcomers)
        });
        let queuing_time = stage_start.elapsed();

        let stage_start = Instant::now();
        let dispatch = pool.install(|| dispatch_all(observers, tick, codec, heartbeat));
        let dispatch_time = stage_start.elapsed();

        let report = TickReport {
            tick,
            observers: self.observers.len(),
            tracked_entities: self.visibility.len(),
            pruned,
            compute,
            queue,
            dispatch,
            visibility_time,
            queuing_time,
            dispatch_time,
            total_time: tick_start.elapsed(),
        };

        self.metrics.record_tick(&report);

        trace!(
            "Tick {}: {} observers, {} visible pairs ({} new), {} full, {} deltas, {} removals, {} sent, {} dropped in {:?}",
            tick,
            report.observers,
            compute.visible_pairs,
            compute.newly_visible_pairs,
            dispatch.full_snapshots,
            dispatch.deltas,
            dispatch.removals,
            dispatch.messages_sent,
            dispatch.messages_dropped,
            report.total_time
        );

        let budget = self.config.tick_interval();
        if report.total_time > budget {
            warn!("Tick {} took {:?}, over the {:?} budget", tick, report.total_time, budget);
        }

        report
    }
}

impl ReplicationEngine<SpatialGrid> {
    /// Remove an entity from the grid and forget its replication state
    pub fn despawn(&mut self, entity: EntityId) -> bool {
        self.forget_entity(entity);
        self.world.remove(entity)
    }
}

impl<S: SpatialIndex> std::fmt::Debug for ReplicationEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("tick", &self.tick)
            .field("observers", &self.observers.len())
            .field("components", &self.registry.len())
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}
