//! Shared read cache of fetched entities.
//!
//! Holds the last fetched [`EntitySnapshot`] per entity. Two writers
//! touch it, each through its own methods and each on disjoint data:
//! the field mutation path owns `fields`, the progress path owns the
//! persisted import fields. Neither can clobber the other.
//!
//! Optimistic writes are tracked as a *pending chain* per field. The
//! chain's anchor is the last value the server is known to hold: the
//! value before the first optimistic write, advanced only by confirmed
//! writes. Rollbacks restore the anchor, never an intermediate
//! optimistic value.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use vidshelf_core::entity::{EntitySnapshot, PersistedProgress};
use vidshelf_core::error::CoreError;
use vidshelf_core::fields::FieldValue;
use vidshelf_core::progress::Stage;
use vidshelf_core::types::{EntityId, FieldId};

/// Broadcast channel capacity for cache change notifications.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Anything that can fetch an entity's current representation.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn fetch_entity(&self, entity_id: &str) -> Result<EntitySnapshot, CoreError>;
}

/// Lifecycle of one cached field.
///
/// `Idle -> Pending -> Idle`; leaving `Pending` either confirms the
/// written value or rolls back to the last confirmed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldState {
    Idle,
    Pending,
}

/// Read view of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldView {
    /// Currently visible value (optimistic while pending).
    pub value: Option<FieldValue>,
    pub state: FieldState,
    /// Rollback target; present only while pending.
    pub previous_value: Option<FieldValue>,
}

/// Identifies one optimistic write inside a pending chain.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTicket {
    generation: u64,
    value: FieldValue,
}

impl WriteTicket {
    pub fn value(&self) -> &FieldValue {
        &self.value
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PendingChain {
    /// Last value the server is known to hold.
    anchor: Option<FieldValue>,
    anchor_generation: u64,
    /// Write whose value is currently visible (anchor's when rolled back).
    visible_generation: u64,
    in_flight: u32,
}

impl PendingChain {
    fn anchored_at(value: Option<FieldValue>) -> Self {
        Self {
            anchor: value,
            anchor_generation: 0,
            visible_generation: 0,
            in_flight: 0,
        }
    }

    fn is_settled(&self) -> bool {
        self.in_flight == 0
    }
}

struct CachedEntity {
    snapshot: EntitySnapshot,
    chains: HashMap<FieldId, PendingChain>,
}

impl CachedEntity {
    fn empty(entity_id: &str) -> Self {
        Self {
            snapshot: EntitySnapshot::new(entity_id),
            chains: HashMap::new(),
        }
    }

    fn set_visible(&mut self, field_id: &str, value: Option<FieldValue>) {
        match value {
            Some(value) => {
                self.snapshot.fields.insert(field_id.to_string(), value);
            }
            None => {
                self.snapshot.fields.remove(field_id);
            }
        }
    }

    fn view(&self, field_id: &str) -> FieldView {
        let chain = self.chains.get(field_id);
        FieldView {
            value: self.snapshot.fields.get(field_id).cloned(),
            state: if chain.is_some() {
                FieldState::Pending
            } else {
                FieldState::Idle
            },
            previous_value: chain.and_then(|c| c.anchor.clone()),
        }
    }

    /// End the chain once nothing is in flight; the visible value
    /// becomes the last confirmed one.
    fn settle(&mut self, field_id: &str) {
        let Some(chain) = self.chains.get(field_id) else {
            return;
        };
        if chain.is_settled() {
            let anchor = chain.anchor.clone();
            self.chains.remove(field_id);
            self.set_visible(field_id, anchor);
        }
    }
}

#[derive(Default)]
struct CacheState {
    entities: HashMap<EntityId, CachedEntity>,
    next_generation: u64,
}

/// Process-wide entity cache.
pub struct EntityCache {
    state: RwLock<CacheState>,
    changes: broadcast::Sender<EntityId>,
}

impl EntityCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(CacheState::default()),
            changes,
        }
    }

    /// Receive the id of every entity whose cached state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityId> {
        self.changes.subscribe()
    }

    /// Install a freshly fetched snapshot.
    ///
    /// Fields with a pending chain keep their optimistic value: the
    /// fetch may have raced the write and the chain resolves them.
    pub async fn seed(&self, mut snapshot: EntitySnapshot) {
        let entity_id = snapshot.id.clone();
        {
            let mut state = self.state.write().await;
            match state.entities.get_mut(&entity_id) {
                Some(entry) => {
                    for field_id in entry.chains.keys() {
                        match entry.snapshot.fields.get(field_id) {
                            Some(value) => {
                                snapshot.fields.insert(field_id.clone(), value.clone());
                            }
                            None => {
                                snapshot.fields.remove(field_id);
                            }
                        }
                    }
                    entry.snapshot = snapshot;
                }
                None => {
                    state.entities.insert(
                        entity_id.clone(),
                        CachedEntity {
                            snapshot,
                            chains: HashMap::new(),
                        },
                    );
                }
            }
        }
        self.notify(entity_id);
    }

    /// Fetch an entity from `source` and seed it.
    pub async fn load(
        &self,
        source: &dyn EntitySource,
        entity_id: &str,
    ) -> Result<EntitySnapshot, CoreError> {
        let snapshot = source.fetch_entity(entity_id).await?;
        self.seed(snapshot).await;
        self.snapshot(entity_id)
            .await
            .ok_or_else(|| CoreError::Internal(format!("entity {entity_id} vanished after seeding")))
    }

    pub async fn snapshot(&self, entity_id: &str) -> Option<EntitySnapshot> {
        self.state
            .read()
            .await
            .entities
            .get(entity_id)
            .map(|e| e.snapshot.clone())
    }

    pub async fn persisted_progress(&self, entity_id: &str) -> Option<PersistedProgress> {
        self.state
            .read()
            .await
            .entities
            .get(entity_id)
            .map(|e| e.snapshot.persisted_progress())
    }

    pub async fn field(&self, entity_id: &str, field_id: &str) -> FieldView {
        match self.state.read().await.entities.get(entity_id) {
            Some(entry) => entry.view(field_id),
            None => FieldView {
                value: None,
                state: FieldState::Idle,
                previous_value: None,
            },
        }
    }

    /// Record a job's final stage on an already cached entity. Field
    /// values are untouched; uncached entities are ignored.
    pub async fn record_import_outcome(
        &self,
        entity_id: &str,
        stage: Option<Stage>,
        progress: Option<u8>,
    ) {
        let updated = {
            let mut state = self.state.write().await;
            match state.entities.get_mut(entity_id) {
                Some(entry) => {
                    entry.snapshot.import_stage = stage;
                    entry.snapshot.import_progress = progress;
                    true
                }
                None => false,
            }
        };
        if updated {
            tracing::debug!(entity_id, "Recorded import outcome in entity cache");
            self.notify(entity_id.to_string());
        }
    }

    /// Start an optimistic write: the value becomes visible immediately.
    ///
    /// The first write of a chain captures the current value as the
    /// rollback anchor; later writes join the existing chain.
    pub async fn begin_write(
        &self,
        entity_id: &str,
        field_id: &str,
        value: FieldValue,
    ) -> WriteTicket {
        let ticket = {
            let mut state = self.state.write().await;
            state.next_generation += 1;
            let generation = state.next_generation;

            let entry = state
                .entities
                .entry(entity_id.to_string())
                .or_insert_with(|| CachedEntity::empty(entity_id));
            let current = entry.snapshot.fields.get(field_id).cloned();
            let chain = entry
                .chains
                .entry(field_id.to_string())
                .or_insert_with(|| PendingChain::anchored_at(current));
            chain.in_flight += 1;
            chain.visible_generation = generation;
            entry.set_visible(field_id, Some(value.clone()));

            WriteTicket { generation, value }
        };
        self.notify(entity_id.to_string());
        ticket
    }

    /// Resolve a write the server accepted.
    ///
    /// `canonical` is the server's echoed value, if any; otherwise the
    /// written value is taken as confirmed.
    pub async fn confirm_write(
        &self,
        entity_id: &str,
        field_id: &str,
        ticket: WriteTicket,
        canonical: Option<FieldValue>,
    ) -> FieldView {
        let view = {
            let mut state = self.state.write().await;
            let Some(entry) = state.entities.get_mut(entity_id) else {
                return Self::orphaned(entity_id, field_id);
            };
            let Some(chain) = entry.chains.get_mut(field_id) else {
                return Self::orphaned(entity_id, field_id);
            };

            let confirmed = canonical.unwrap_or(ticket.value);
            chain.in_flight = chain.in_flight.saturating_sub(1);
            if ticket.generation > chain.anchor_generation {
                chain.anchor = Some(confirmed.clone());
                chain.anchor_generation = ticket.generation;
            }
            let show = ticket.generation >= chain.visible_generation;
            if show {
                chain.visible_generation = ticket.generation;
                entry.set_visible(field_id, Some(confirmed));
            }
            entry.settle(field_id);
            entry.view(field_id)
        };
        self.notify(entity_id.to_string());
        view
    }

    /// Resolve a write the server rejected.
    ///
    /// If the rejected value is the one on screen it is replaced by the
    /// last confirmed value. Once the chain has nothing in flight the
    /// field returns to idle holding that confirmed value.
    pub async fn reject_write(
        &self,
        entity_id: &str,
        field_id: &str,
        ticket: WriteTicket,
    ) -> FieldView {
        let view = {
            let mut state = self.state.write().await;
            let Some(entry) = state.entities.get_mut(entity_id) else {
                return Self::orphaned(entity_id, field_id);
            };
            let Some(chain) = entry.chains.get_mut(field_id) else {
                return Self::orphaned(entity_id, field_id);
            };

            chain.in_flight = chain.in_flight.saturating_sub(1);
            if chain.visible_generation == ticket.generation {
                chain.visible_generation = chain.anchor_generation;
                let anchor = chain.anchor.clone();
                entry.set_visible(field_id, anchor);
            }
            entry.settle(field_id);
            entry.view(field_id)
        };
        self.notify(entity_id.to_string());
        view
    }

    fn orphaned(entity_id: &str, field_id: &str) -> FieldView {
        tracing::warn!(entity_id, field_id, "Write resolved for a field with no pending chain");
        FieldView {
            value: None,
            state: FieldState::Idle,
            previous_value: None,
        }
    }

    fn notify(&self, entity_id: EntityId) {
        // Zero receivers is fine; nobody is watching yet.
        let _ = self.changes.send(entity_id);
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}
