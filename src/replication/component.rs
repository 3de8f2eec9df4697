//! Trackable component kinds and the update records they produce
//!
//! The core never looks inside components. Each kind registers a
//! [`ComponentReplicator`] that can build a full snapshot (and optionally a
//! cheaper delta) for an entity; the update queuing stage iterates the
//! registry generically.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::replication::ReplicationError;
use crate::world::EntityId;

/// Index of a registered component kind (registration order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKind(pub u16);

/// One queued update for one entity, owned by a single observer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRecord {
    /// Complete component state, sent when the observer first sees the entity
    FullSnapshot { kind: ComponentKind, data: Vec<u8> },
    /// Only what changed since the observer's last update
    Delta { kind: ComponentKind, payload: Vec<u8> },
}

impl UpdateRecord {
    #[inline]
    pub fn kind(&self) -> ComponentKind {
        match self {
            UpdateRecord::FullSnapshot { kind, .. } | UpdateRecord::Delta { kind, .. } => *kind,
        }
    }

    #[inline]
    pub fn is_full_snapshot(&self) -> bool {
        matches!(self, UpdateRecord::FullSnapshot { .. })
    }

    /// Encoded payload size in bytes
    pub fn payload_len(&self) -> usize {
        match self {
            UpdateRecord::FullSnapshot { data, .. } => data.len(),
            UpdateRecord::Delta { payload, .. } => payload.len(),
        }
    }
}

/// Producer of update payloads for one component kind.
///
/// Called concurrently from the worker pool, at most once per entity per
/// tick for each method; the result is copied to every observer.
pub trait ComponentReplicator: Send + Sync {
    /// Full encoded state of the component on `entity`, `None` if the entity
    /// does not carry this component
    fn snapshot(&self, entity: EntityId) -> Option<Vec<u8>>;

    /// Encoded change since the last tick. Returning `None` means this kind
    /// has no cheap delta and observers that already see the entity get a
    /// full snapshot instead.
    fn delta(&self, _entity: EntityId) -> Option<Vec<u8>> {
        None
    }
}

/// Registry entry pairing a kind with its producer
#[derive(Clone)]
pub struct RegisteredComponent {
    pub kind: ComponentKind,
    pub name: &'static str,
    pub replicator: Arc<dyn ComponentReplicator>,
}

impl std::fmt::Debug for RegisteredComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredComponent")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

/// All component kinds registered as trackable
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    entries: Vec<RegisteredComponent>,
    by_name: HashMap<&'static str, ComponentKind>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component kind. Names must be unique.
    pub fn register(
        &mut self,
        name: &'static str,
        replicator: Arc<dyn ComponentReplicator>,
    ) -> Result<ComponentKind, ReplicationError> {
        if self.by_name.contains_key(name) {
            return Err(ReplicationError::DuplicateComponent(name));
        }
        let index = u16::try_from(self.entries.len()).map_err(|_| ReplicationError::TooManyComponents(name))?;
        let kind = ComponentKind(index);
        self.entries.push(RegisteredComponent { kind, name, replicator });
        self.by_name.insert(name, kind);
        Ok(kind)
    }

    #[inline]
    pub fn get(&self, kind: ComponentKind) -> Option<&RegisteredComponent> {
        self.entries.get(kind.0 as usize)
    }

    #[inline]
    pub fn contains(&self, kind: ComponentKind) -> bool {
        (kind.0 as usize) < self.entries.len()
    }

    pub fn kind_by_name(&self, name: &str) -> Option<ComponentKind> {
        self.by_name.get(name).copied()
    }

    pub fn entries(&self) -> &[RegisteredComponent] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Component Store
// ============================================================================

/// Simple per-entity component storage that replicates itself with bincode.
///
/// Gameplay writes values with [`ComponentStore::set`] and then flags the
/// entity with `ReplicationEngine::mark_outdated`. With deltas enabled, the
/// delta payload is the new value itself, which is the whole change for
/// scalar-like components (health, score, team).
pub struct ComponentStore<T> {
    values: RwLock<HashMap<EntityId, T>>,
    send_deltas: bool,
}

impl<T> ComponentStore<T>
where
    T: Serialize + Clone + Send + Sync,
{
    /// Store that always replicates full snapshots
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            send_deltas: false,
        }
    }

    /// Store that sends deltas to observers already seeing the entity
    pub fn with_deltas() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            send_deltas: true,
        }
    }

    /// Set a value, returning the previous one
    pub fn set(&self, entity: EntityId, value: T) -> Option<T> {
        self.values.write().insert(entity, value)
    }

    pub fn get(&self, entity: EntityId) -> Option<T> {
        self.values.read().get(&entity).cloned()
    }

    pub fn remove(&self, entity: EntityId) -> Option<T> {
        self.values.write().remove(&entity)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    fn encode(&self, entity: EntityId) -> Option<Vec<u8>> {
        let values = self.values.read();
        let value = values.get(&entity)?;
        match bincode::serde::encode_to_vec(value, bincode::config::legacy()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Failed to encode component for {}: {}", entity, e);
                None
            }
        }
    }
}

impl<T> Default for ComponentStore<T>
where
    T: Serialize + Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ComponentReplicator for ComponentStore<T>
where
    T: Serialize + Clone + Send + Sync,
{
    fn snapshot(&self, entity: EntityId) -> Option<Vec<u8>> {
        self.encode(entity)
    }

    fn delta(&self, entity: EntityId) -> Option<Vec<u8>> {
        if self.send_deltas {
            self.encode(entity)
        } else {
            None
        }
    }
}
