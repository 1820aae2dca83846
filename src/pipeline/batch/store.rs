//! ItemStore: the keyed item collection (id → item).
//!
//! The only shared mutable state in the pipeline. Every update is a whole-item
//! functional replacement keyed by id; readers get cloned snapshots.

use std::collections::{HashMap, HashSet};

use super::types::{ItemId, ItemStatus, TrackableItem};

#[derive(Debug, Default)]
pub struct ItemStore {
    items: HashMap<ItemId, TrackableItem>,
    /// Insertion order, for stable snapshots.
    order: Vec<ItemId>,
    /// Preview references currently held by live items.
    previews: HashSet<String>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: TrackableItem) -> ItemId {
        let id = item.id();
        self.previews.insert(item.preview().to_string());
        if self.items.insert(id, item).is_none() {
            self.order.push(id);
        }
        id
    }

    /// Delete an item, releasing its preview reference.
    pub fn remove(&mut self, id: ItemId) -> Option<TrackableItem> {
        let item = self.items.remove(&id)?;
        self.order.retain(|i| *i != id);
        self.previews.remove(item.preview());
        tracing::debug!(item_id = %id, "Item removed, preview released");
        Some(item)
    }

    pub fn get(&self, id: ItemId) -> Option<TrackableItem> {
        self.items.get(&id).cloned()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items in insertion order.
    pub fn snapshot(&self) -> Vec<TrackableItem> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id).cloned())
            .collect()
    }

    /// Ids of items in `status`, in insertion order.
    pub fn ids_with_status(&self, status: ItemStatus) -> Vec<ItemId> {
        self.order
            .iter()
            .filter(|id| self.items.get(id).is_some_and(|i| i.status() == status))
            .copied()
            .collect()
    }

    /// Replace the item under `id` with `f(item)`. Returns false if the id is
    /// unknown (e.g. deleted while its request was in flight).
    pub fn update<F>(&mut self, id: ItemId, f: F) -> bool
    where
        F: FnOnce(TrackableItem) -> TrackableItem,
    {
        let Some(current) = self.items.remove(&id) else {
            return false;
        };
        let next = f(current);
        debug_assert_eq!(next.id(), id, "item id changed during update");
        self.items.insert(id, next);
        true
    }

    /// Apply `f` to every listed id that still exists.
    pub fn update_many<F>(&mut self, ids: &[ItemId], f: F) -> usize
    where
        F: Fn(TrackableItem) -> TrackableItem,
    {
        ids.iter().filter(|id| self.update(**id, &f)).count()
    }

    pub fn live_previews(&self) -> usize {
        self.previews.len()
    }
}
