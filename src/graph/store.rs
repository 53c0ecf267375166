use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use super::image::{Cell, Image, Sequence};

pub trait Entity {
    fn entity_id(&self) -> &str;
}

impl Entity for Image {
    fn entity_id(&self) -> &str {
        self.id()
    }
}

impl Entity for Sequence {
    fn entity_id(&self) -> &str {
        self.id()
    }
}

impl Entity for Cell {
    fn entity_id(&self) -> &str {
        self.id()
    }
}

#[derive(Debug)]
struct Slot<E> {
    entity: E,
    accessed: AtomicU64,
}

/// Id-keyed entity table that remembers when each entry was last read.
///
/// Reads go through `&self` so that lookups under a shared lock still feed the recency order
/// used by eviction.
#[derive(Debug)]
pub struct Store<E> {
    slots: BTreeMap<String, Slot<E>>,
    clock: AtomicU64,
}

impl<E> Default for Store<E> {
    fn default() -> Self {
        Store {
            slots: BTreeMap::new(),
            clock: AtomicU64::new(0),
        }
    }
}

impl<E: Entity> Store<E> {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn has(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Looks up an entity and marks it as recently used.
    pub fn get(&self, id: &str) -> Option<&E> {
        let slot = self.slots.get(id)?;
        slot.accessed.store(self.tick(), Ordering::Relaxed);
        Some(&slot.entity)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut E> {
        let tick = self.tick();
        let slot = self.slots.get_mut(id)?;
        *slot.accessed.get_mut() = tick;
        Some(&mut slot.entity)
    }

    /// Looks up an entity without touching its recency.
    pub fn peek(&self, id: &str) -> Option<&E> {
        self.slots.get(id).map(|slot| &slot.entity)
    }

    /// Inserts or replaces an entity under its own id.
    pub fn put(&mut self, entity: E) -> Option<E> {
        let accessed = AtomicU64::new(self.tick());
        let id = entity.entity_id().to_string();
        self.slots
            .insert(id, Slot { entity, accessed })
            .map(|slot| slot.entity)
    }

    pub fn remove(&mut self, id: &str) -> Option<E> {
        self.slots.remove(id).map(|slot| slot.entity)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.slots.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.slots.values().map(|slot| &slot.entity)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.slots.values_mut().map(|slot| &mut slot.entity)
    }

    /// Ids of the entities matching `select`, most recently used first.
    pub fn ids_by_recency<F>(&self, mut select: F) -> Vec<String>
    where
        F: FnMut(&E) -> bool,
    {
        let mut ids = self
            .slots
            .iter()
            .filter(|(_, slot)| select(&slot.entity))
            .map(|(id, slot)| (slot.accessed.load(Ordering::Relaxed), id.clone()))
            .collect::<Vec<_>>();
        ids.sort_by(|a, b| b.0.cmp(&a.0));
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

/// Every table held by the graph.
#[derive(Debug, Default)]
pub struct EntityStore {
    pub images: Store<Image>,
    pub sequences: Store<Sequence>,
    pub cells: Store<Cell>,
}

impl EntityStore {
    /// Cell for `cell_id`, created empty and uncached when missing.
    pub fn cell_entry(&mut self, cell_id: &str) -> &mut Cell {
        let tick = self.cells.tick();
        let slot = self
            .cells
            .slots
            .entry(cell_id.to_string())
            .or_insert_with(|| Slot {
                entity: Cell::new(cell_id),
                accessed: AtomicU64::new(0),
            });
        *slot.accessed.get_mut() = tick;
        &mut slot.entity
    }
}
