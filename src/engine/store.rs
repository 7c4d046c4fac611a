use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

/// In-memory storage for every property of one tenant.
///
/// Each property sits behind its own `RwLock`; a mutation holds write guards
/// on every property it touches from the conflict check until the change is
/// durable and applied, which makes check-then-write atomic per property.
/// The commit gate lets WAL compaction wait out in-flight mutations.
pub struct PropertyStore {
    properties: DashMap<PropertyId, SharedPropertyState>,
    /// Reverse lookups: entity id → property id.
    booking_index: DashMap<Ulid, PropertyId>,
    block_index: DashMap<Ulid, PropertyId>,
    commit_gate: Arc<RwLock<()>>,
}

/// Write guards over one or two properties, taken in sorted order.
/// `target` is the property the caller checks conflicts against.
pub struct PropertyTxn {
    guards: Vec<(PropertyId, OwnedRwLockWriteGuard<PropertyState>)>,
    target: usize,
    _gate: OwnedRwLockReadGuard<()>,
}

impl PropertyTxn {
    pub fn target(&self) -> &PropertyState {
        &self.guards[self.target].1
    }

    pub fn state(&self, property_id: &str) -> Option<&PropertyState> {
        self.guards
            .iter()
            .find(|(pid, _)| pid == property_id)
            .map(|(_, guard)| &**guard)
    }

    pub fn state_mut(&mut self, property_id: &str) -> Option<&mut PropertyState> {
        self.guards
            .iter_mut()
            .find(|(pid, _)| pid == property_id)
            .map(|(_, guard)| &mut **guard)
    }
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyStore {
    pub fn new() -> Self {
        Self {
            properties: DashMap::new(),
            booking_index: DashMap::new(),
            block_index: DashMap::new(),
            commit_gate: Arc::new(RwLock::new(())),
        }
    }

    // ── Properties ───────────────────────────────────────────

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn get_property(&self, property_id: &str) -> Option<SharedPropertyState> {
        self.properties.get(property_id).map(|e| e.value().clone())
    }

    fn get_or_insert_property(&self, property_id: &str) -> SharedPropertyState {
        self.properties
            .entry(property_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(PropertyState::new(property_id.to_string()))))
            .value()
            .clone()
    }

    pub fn property_ids(&self) -> Vec<PropertyId> {
        let mut ids: Vec<PropertyId> = self.properties.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Snapshot of the shared states, sorted by property id. Never hold a
    /// DashMap reference across an `.await`; clone the Arcs out first.
    pub fn property_states(&self) -> Vec<SharedPropertyState> {
        self.property_ids()
            .iter()
            .filter_map(|pid| self.get_property(pid))
            .collect()
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn property_of_booking(&self, id: &Ulid) -> Option<PropertyId> {
        self.booking_index.get(id).map(|e| e.value().clone())
    }

    pub fn property_of_block(&self, id: &Ulid) -> Option<PropertyId> {
        self.block_index.get(id).map(|e| e.value().clone())
    }

    // ── Locking ──────────────────────────────────────────────

    /// Lock `target` and optionally a second property for writing.
    pub async fn lock(&self, target: &str, other: Option<&str>) -> PropertyTxn {
        let gate = self.commit_gate.clone().read_owned().await;
        let ids = lock_order(target, other);
        let mut guards = Vec::with_capacity(ids.len());
        for pid in ids {
            let rs = self.get_or_insert_property(&pid);
            guards.push((pid, rs.write_owned().await));
        }
        let target = position_of(&guards, target);
        PropertyTxn {
            guards,
            target,
            _gate: gate,
        }
    }

    /// Non-waiting variant for replay, where nothing else holds a lock.
    pub fn try_lock(&self, target: &str, other: Option<&str>) -> Option<PropertyTxn> {
        let gate = self.commit_gate.clone().try_read_owned().ok()?;
        let ids = lock_order(target, other);
        let mut guards = Vec::with_capacity(ids.len());
        for pid in ids {
            let rs = self.get_or_insert_property(&pid);
            guards.push((pid, rs.try_write_owned().ok()?));
        }
        let target = position_of(&guards, target);
        Some(PropertyTxn {
            guards,
            target,
            _gate: gate,
        })
    }

    /// Block new mutations until the returned guard drops.
    pub async fn freeze(&self) -> OwnedRwLockWriteGuard<()> {
        self.commit_gate.clone().write_owned().await
    }

    // ── Event application ────────────────────────────────────

    /// The property that currently owns the entity an event rewrites, if it
    /// differs from the event's own property.
    pub fn previous_property(&self, event: &Event) -> Option<PropertyId> {
        let prev = match event {
            Event::BookingSaved { booking } => self.property_of_booking(&booking.id),
            Event::BlockSaved { block } => self.property_of_block(&block.id),
            Event::BlockDeleted { .. } => None,
        }?;
        (prev != event.property_id()).then_some(prev)
    }

    /// Apply an event to the locked states (caller holds the locks for both
    /// the event's property and `previous_property`).
    pub fn apply(&self, txn: &mut PropertyTxn, event: &Event) {
        let moved_from = self.previous_property(event);
        match event {
            Event::BookingSaved { booking } => {
                if let Some(prev) = moved_from
                    && let Some(old) = txn.state_mut(&prev)
                {
                    old.remove_booking(booking.id);
                }
                if let Some(state) = txn.state_mut(&booking.property_id) {
                    state.upsert_booking(booking.clone());
                }
                self.booking_index.insert(booking.id, booking.property_id.clone());
            }
            Event::BlockSaved { block } => {
                if let Some(prev) = moved_from
                    && let Some(old) = txn.state_mut(&prev)
                {
                    old.remove_block(block.id);
                }
                if let Some(state) = txn.state_mut(&block.property_id) {
                    state.upsert_block(block.clone());
                }
                self.block_index.insert(block.id, block.property_id.clone());
            }
            Event::BlockDeleted { id, property_id } => {
                if let Some(state) = txn.state_mut(property_id) {
                    state.remove_block(*id);
                }
                self.block_index.remove(id);
            }
        }
    }
}

fn lock_order(target: &str, other: Option<&str>) -> Vec<PropertyId> {
    let mut ids = vec![target.to_string()];
    if let Some(o) = other {
        ids.push(o.to_string());
    }
    ids.sort();
    ids.dedup();
    ids
}

fn position_of(guards: &[(PropertyId, OwnedRwLockWriteGuard<PropertyState>)], pid: &str) -> usize {
    guards.iter().position(|(p, _)| p == pid).unwrap_or(0)
}
