//! Per-observer replication state
//!
//! A [`ViewerState`] buffers one observer's view across a tick boundary:
//! what it sees now, what its client was last told about, and the updates
//! queued for it this tick. Only tasks working for this observer mutate the
//! visible sets; the pending map is the one piece written by several
//! component-kind tasks at once, so it sits behind its own mutex.

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::net::codec::{EntityUpdate, OutgoingMessage};
use crate::net::sink::NetworkSink;
use crate::replication::component::{ComponentKind, UpdateRecord};
use crate::replication::ObserverId;
use crate::world::EntityId;

/// Updates queued for one observer during the current tick
#[derive(Debug)]
struct PendingUpdates {
    updates: HashMap<(EntityId, ComponentKind), UpdateRecord>,
    /// Cap on distinct (entity, kind) keys per tick
    cap: usize,
    /// Cap was hit this tick; everything queued is discarded
    overflowed: bool,
    /// Rebuild tick: the whole view is owed, so the cap is lifted
    uncapped: bool,
}

impl PendingUpdates {
    fn new(cap: usize) -> Self {
        Self {
            updates: HashMap::new(),
            cap,
            overflowed: false,
            uncapped: false,
        }
    }
}

/// Result of queuing one update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Inserted a new pending update
    Queued,
    /// Replaced an update already pending for the same entity and kind
    Replaced,
    /// The pending cap was hit; the observer will be resynced
    Overflowed,
}

/// One observer's visibility and outgoing-update state
pub struct ViewerState {
    id: ObserverId,
    /// Entity the observer is attached to; its position centers the view
    host: EntityId,
    view_radius: f64,
    currently_visible: HashSet<EntityId>,
    sent_last_tick: HashSet<EntityId>,
    pending: Mutex<PendingUpdates>,
    sink: Option<Box<dyn NetworkSink>>,
    /// Treat every visible entity as newly visible on the next tick
    force_new_next_tick: bool,
    /// Flag the next message as a full resync
    announce_resync: bool,
    disconnected: bool,
    host_lost: bool,
}

impl ViewerState {
    pub fn new(
        id: ObserverId,
        host: EntityId,
        view_radius: f64,
        max_pending_updates: usize,
        sink: Option<Box<dyn NetworkSink>>,
    ) -> Self {
        Self {
            id,
            host,
            view_radius,
            currently_visible: HashSet::new(),
            sent_last_tick: HashSet::new(),
            pending: Mutex::new(PendingUpdates::new(max_pending_updates)),
            sink,
            // A reused observer id must not inherit an earlier session's visibility history
            force_new_next_tick: true,
            announce_resync: false,
            disconnected: false,
            host_lost: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ObserverId {
        self.id
    }

    #[inline]
    pub fn host(&self) -> EntityId {
        self.host
    }

    #[inline]
    pub fn view_radius(&self) -> f64 {
        self.view_radius
    }

    /// Reset the visible set; must precede this tick's visibility query
    pub fn begin_tick(&mut self) {
        self.currently_visible.clear();
    }

    #[inline]
    pub fn record_visible(&mut self, entity: EntityId) {
        self.currently_visible.insert(entity);
    }

    /// Queue an update for `entity`. A later update for the same entity and
    /// component kind in the same tick replaces the earlier one.
    pub fn queue_update(&self, entity: EntityId, record: UpdateRecord) -> QueueOutcome {
        let mut pending = self.pending.lock();
        if pending.overflowed {
            return QueueOutcome::Overflowed;
        }

        let key = (entity, record.kind());
        if let Some(slot) = pending.updates.get_mut(&key) {
            *slot = record;
            return QueueOutcome::Replaced;
        }
        if !pending.uncapped && pending.updates.len() >= pending.cap {
            pending.overflowed = true;
            pending.updates.clear();
            return QueueOutcome::Overflowed;
        }
        pending.updates.insert(key, record);
        QueueOutcome::Queued
    }

    /// Entities the client was told about last tick that are no longer visible
    pub fn compute_removals(&self) -> Vec<EntityId> {
        let mut removals: Vec<EntityId> = self
            .sent_last_tick
            .difference(&self.currently_visible)
            .copied()
            .collect();
        removals.sort_unstable();
        removals
    }

    /// Build this tick's message and roll the state forward.
    ///
    /// Takes `&mut self`, so every `queue_update` for the tick has already
    /// returned. After this call `sent_last_tick` equals this tick's visible
    /// set and the pending map is empty.
    pub fn drain_and_dispatch(&mut self, tick: u64) -> OutgoingMessage {
        let pending = self.pending.get_mut();
        pending.uncapped = false;

        if pending.overflowed {
            pending.overflowed = false;
            pending.updates.clear();
            // The client drops its whole view; next tick rebuilds it from full snapshots
            self.sent_last_tick.clear();
            self.force_new_next_tick = true;
            self.announce_resync = false;
            return OutgoingMessage::resync(tick);
        }

        let mut updates: Vec<EntityUpdate> = pending
            .updates
            .drain()
            .map(|((entity, _), record)| EntityUpdate { entity, record })
            .collect();
        updates.sort_unstable_by_key(|u| (u.entity, u.record.kind()));

        let removals = self.compute_removals();
        self.sent_last_tick.clone_from(&self.currently_visible);

        OutgoingMessage {
            tick,
            full_resync: std::mem::take(&mut self.announce_resync),
            removals,
            updates,
        }
    }

    /// The message built this tick never reached the client. Forget what it
    /// was told and rebuild its view next tick behind a resync flag.
    pub fn note_message_lost(&mut self) {
        self.sent_last_tick.clear();
        self.force_new_next_tick = true;
        self.announce_resync = true;
    }

    /// Consume the "treat everything as newly visible" request. A forced
    /// tick rebuilds the client's whole view, so its updates are not capped.
    pub fn take_force_new(&mut self) -> bool {
        let force_new = std::mem::take(&mut self.force_new_next_tick);
        self.pending.get_mut().uncapped = force_new;
        force_new
    }

    /// This tick rebuilds the client's view and ignores the pending cap
    pub fn is_rebuilding(&self) -> bool {
        self.pending.lock().uncapped
    }

    pub fn currently_visible(&self) -> &HashSet<EntityId> {
        &self.currently_visible
    }

    pub fn sent_last_tick(&self) -> &HashSet<EntityId> {
        &self.sent_last_tick
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().updates.len()
    }

    pub fn is_overflowed(&self) -> bool {
        self.pending.lock().overflowed
    }

    pub fn sink(&self) -> Option<&dyn NetworkSink> {
        self.sink.as_deref()
    }

    pub fn mark_disconnected(&mut self) {
        self.disconnected = true;
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn mark_host_lost(&mut self) {
        self.host_lost = true;
    }

    pub fn is_host_lost(&self) -> bool {
        self.host_lost
    }

    /// Disconnected or host entity gone; pruned at the start of the next tick
    pub fn should_prune(&self) -> bool {
        self.disconnected || self.host_lost
    }
}

impl std::fmt::Debug for ViewerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerState")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("view_radius", &self.view_radius)
            .field("currently_visible", &self.currently_visible.len())
            .field("sent_last_tick", &self.sent_last_tick.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
