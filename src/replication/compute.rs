//! Visibility computation stage
//!
//! One spatial query per observer, run in parallel across observers. Each
//! hit is recorded twice: in the observer's own visible set (owned by the
//! task) and in the entity's shared [`VisibilityState`]. Marking is
//! idempotent and commutative, so the resulting `visible_to` sets do not
//! depend on how tasks are scheduled.
//!
//! [`VisibilityState`]: crate::replication::visibility::VisibilityState

use hashbrown::HashMap;
use rayon::prelude::*;

use crate::replication::viewer::ViewerState;
use crate::replication::visibility::{viewer_flags, VisibilityTable};
use crate::replication::ObserverId;
use crate::world::spatial::SpatialIndex;

/// Counts produced by one visibility pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ComputeStats {
    pub observers: usize,
    pub visible_pairs: usize,
    pub newly_visible_pairs: usize,
    pub hosts_lost: usize,
    /// Visibility records dropped after a full tick without observers
    pub records_collected: usize,
}

impl ComputeStats {
    fn merge(self, other: Self) -> Self {
        Self {
            observers: self.observers + other.observers,
            visible_pairs: self.visible_pairs + other.visible_pairs,
            newly_visible_pairs: self.newly_visible_pairs + other.newly_visible_pairs,
            hosts_lost: self.hosts_lost + other.hosts_lost,
            records_collected: self.records_collected + other.records_collected,
        }
    }
}

/// Run the visibility stage for every observer.
///
/// Must be called inside the engine's worker pool. Returns only after every
/// observer task has finished and unobserved records were collected.
pub fn compute_visibility<S: SpatialIndex>(
    observers: &mut HashMap<ObserverId, ViewerState>,
    table: &VisibilityTable,
    index: &S,
    include_self: bool,
) -> ComputeStats {
    table.begin_tick();

    let mut stats = observers
        .par_values_mut()
        .map(|viewer| compute_observer(viewer, table, index, include_self))
        .reduce(ComputeStats::default, ComputeStats::merge);

    stats.records_collected = table.collect_garbage();
    stats
}

/// Resolve one observer's view into its own state and the shared table
pub fn compute_observer<S: SpatialIndex>(
    viewer: &mut ViewerState,
    table: &VisibilityTable,
    index: &S,
    include_self: bool,
) -> ComputeStats {
    viewer.begin_tick();
    let force_new = viewer.take_force_new();
    let (id, host, radius) = (viewer.id(), viewer.host(), viewer.view_radius());

    let mut stats = ComputeStats {
        observers: 1,
        ..Default::default()
    };

    let Some(center) = index.position_of(host) else {
        viewer.mark_host_lost();
        stats.hosts_lost = 1;
        return stats;
    };

    index.query_radius(center, radius, |entity| {
        let flags = if entity == host {
            if !include_self {
                return;
            }
            viewer_flags::HOST
        } else {
            0
        };

        viewer.record_visible(entity);
        if table.mark_visible(entity, id, flags, force_new) {
            stats.newly_visible_pairs += 1;
        }
        stats.visible_pairs += 1;
    });

    stats
}
