//! The entity store: the only mutable truth in the simulation.
//!
//! Component data lives in one contiguous [`ComponentTable`] per component
//! type (an ascending id column beside a value column). Ids are allocated
//! monotonically and never reused, so a destroyed id is a permanent
//! tombstone and every later lookup of it reports [`StoreError::NotFound`].

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::component::{
    ComponentSet, Consumer, EntityFault, EntityKind, EntityRecord, Inventory, MachineState, Mover,
    Position, Producer,
};
use crate::id::EntityId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("entity {0} not found")]
    NotFound(EntityId),
    #[error("entity {id} has no {component} component")]
    MissingComponent {
        id: EntityId,
        component: &'static str,
    },
}

// ---------------------------------------------------------------------------
// ComponentTable
// ---------------------------------------------------------------------------

/// Column storage for one component type.
///
/// `ids` is kept sorted ascending. Removal leaves a `None` in the value
/// column; the table is compacted once dead slots outnumber live ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentTable<T> {
    ids: Vec<EntityId>,
    values: Vec<Option<T>>,
    dead: usize,
}

impl<T> Default for ComponentTable<T> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            values: Vec::new(),
            dead: 0,
        }
    }
}

impl<T> ComponentTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: EntityId) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    /// Insert or overwrite the value for `id`.
    pub fn insert(&mut self, id: EntityId, value: T) {
        match self.ids.last() {
            Some(last) if *last >= id => match self.ids.binary_search(&id) {
                Ok(slot) => {
                    if self.values[slot].is_none() {
                        self.dead -= 1;
                    }
                    self.values[slot] = Some(value);
                }
                Err(slot) => {
                    self.ids.insert(slot, id);
                    self.values.insert(slot, Some(value));
                }
            },
            _ => {
                self.ids.push(id);
                self.values.push(Some(value));
            }
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.slot(id).and_then(|slot| self.values[slot].as_ref())
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        let slot = self.slot(id)?;
        self.values[slot].as_mut()
    }

    pub fn remove(&mut self, id: EntityId) -> Option<T> {
        let slot = self.slot(id)?;
        let value = self.values[slot].take();
        if value.is_some() {
            self.dead += 1;
            if self.dead > self.len() {
                self.compact();
            }
        }
        value
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.ids.len() - self.dead
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop tombstoned slots.
    pub fn compact(&mut self) {
        if self.dead == 0 {
            return;
        }
        let ids = std::mem::take(&mut self.ids);
        let values = std::mem::take(&mut self.values);
        for (id, value) in ids.into_iter().zip(values) {
            if value.is_some() {
                self.ids.push(id);
                self.values.push(value);
            }
        }
        self.dead = 0;
    }

    /// Live entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.ids
            .iter()
            .zip(self.values.iter())
            .filter_map(|(id, v)| v.as_ref().map(|v| (*id, v)))
    }

    /// First live entry with an id strictly greater than `after`.
    fn first_after(&self, after: Option<EntityId>) -> Option<(EntityId, &T)> {
        let start = match after {
            Some(after) => self.ids.partition_point(|id| *id <= after),
            None => 0,
        };
        self.ids[start..]
            .iter()
            .zip(self.values[start..].iter())
            .find_map(|(id, v)| v.as_ref().map(|v| (*id, v)))
    }
}

impl<T: PartialEq> PartialEq for ComponentTable<T> {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A type stored in one of the store's component tables.
pub trait Component: Clone + Sized + 'static {
    const NAME: &'static str;
    fn table(store: &EntityStore) -> &ComponentTable<Self>;
    fn table_mut(store: &mut EntityStore) -> &mut ComponentTable<Self>;
}

macro_rules! impl_component {
    ($ty:ty, $field:ident, $name:literal) => {
        impl Component for $ty {
            const NAME: &'static str = $name;
            fn table(store: &EntityStore) -> &ComponentTable<Self> {
                &store.$field
            }
            fn table_mut(store: &mut EntityStore) -> &mut ComponentTable<Self> {
                &mut store.$field
            }
        }
    };
}

impl_component!(Position, positions, "Position");
impl_component!(Inventory, inventories, "Inventory");
impl_component!(Producer, producers, "Producer");
impl_component!(Consumer, consumers, "Consumer");
impl_component!(Mover, movers, "Mover");
impl_component!(MachineState, machine_states, "MachineState");

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Restartable traversal over one component type.
///
/// The cursor remembers only the last id it yielded, so the store may be
/// mutated between calls: destroyed entities are skipped and entities
/// created later are picked up.
#[derive(Debug, Clone)]
pub struct Cursor<T> {
    after: Option<EntityId>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> Cursor<T> {
    fn new() -> Self {
        Self {
            after: None,
            _marker: PhantomData,
        }
    }

    pub fn next<'s>(&mut self, store: &'s EntityStore) -> Option<(EntityId, &'s T)> {
        let (id, value) = T::table(store).first_after(self.after)?;
        self.after = Some(id);
        Some((id, value))
    }

    /// Start over from the lowest id.
    pub fn reset(&mut self) {
        self.after = None;
    }

    pub fn position(&self) -> Option<EntityId> {
        self.after
    }
}

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStore {
    next_id: u64,
    /// Tick stamped onto newly created entities.
    current_tick: u64,
    records: BTreeMap<EntityId, EntityRecord>,
    positions: ComponentTable<Position>,
    inventories: ComponentTable<Inventory>,
    producers: ComponentTable<Producer>,
    consumers: ComponentTable<Consumer>,
    movers: ComponentTable<Mover>,
    machine_states: ComponentTable<MachineState>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_tick(&mut self, tick: u64) {
        self.current_tick = tick;
    }

    /// Allocate a fresh id and store every component in `set`.
    pub fn create(&mut self, set: ComponentSet) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;

        self.records.insert(
            id,
            EntityRecord {
                kind: set.kind,
                created_tick: self.current_tick,
                fault: None,
            },
        );
        if let Some(v) = set.position {
            self.positions.insert(id, v);
        }
        if let Some(v) = set.inventory {
            self.inventories.insert(id, v);
        }
        if let Some(v) = set.producer {
            self.producers.insert(id, v);
        }
        if let Some(v) = set.consumer {
            self.consumers.insert(id, v);
        }
        if let Some(v) = set.mover {
            self.movers.insert(id, v);
        }
        if let Some(v) = set.machine_state {
            self.machine_states.insert(id, v);
        }
        id
    }

    /// Remove an entity and return the components it held.
    pub fn destroy(&mut self, id: EntityId) -> Result<ComponentSet, StoreError> {
        let record = self.records.remove(&id).ok_or(StoreError::NotFound(id))?;
        Ok(ComponentSet {
            kind: record.kind,
            position: self.positions.remove(id),
            inventory: self.inventories.remove(id),
            producer: self.producers.remove(id),
            consumer: self.consumers.remove(id),
            mover: self.movers.remove(id),
            machine_state: self.machine_states.remove(id),
        })
    }

    pub fn is_live(&self, id: EntityId) -> bool {
        self.records.contains_key(&id)
    }

    /// Allocated once and since destroyed.
    pub fn is_tombstoned(&self, id: EntityId) -> bool {
        id.0 < self.next_id && !self.is_live(id)
    }

    pub fn get<T: Component>(&self, id: EntityId) -> Result<&T, StoreError> {
        if !self.is_live(id) {
            return Err(StoreError::NotFound(id));
        }
        T::table(self).get(id).ok_or(StoreError::MissingComponent {
            id,
            component: T::NAME,
        })
    }

    pub fn get_mut<T: Component>(&mut self, id: EntityId) -> Result<&mut T, StoreError> {
        if !self.is_live(id) {
            return Err(StoreError::NotFound(id));
        }
        T::table_mut(self)
            .get_mut(id)
            .ok_or(StoreError::MissingComponent {
                id,
                component: T::NAME,
            })
    }

    /// Attach or overwrite a component on a live entity.
    pub fn set<T: Component>(&mut self, id: EntityId, value: T) -> Result<(), StoreError> {
        if !self.is_live(id) {
            return Err(StoreError::NotFound(id));
        }
        T::table_mut(self).insert(id, value);
        Ok(())
    }

    pub fn has<T: Component>(&self, id: EntityId) -> bool {
        self.is_live(id) && T::table(self).get(id).is_some()
    }

    /// Visit every live entity carrying `T`, in creation order.
    pub fn for_each_of_type<T: Component>(&self, mut f: impl FnMut(EntityId, &T)) {
        for (id, value) in T::table(self).iter() {
            f(id, value);
        }
    }

    pub fn iter_of_type<T: Component>(&self) -> impl Iterator<Item = (EntityId, &T)> {
        T::table(self).iter()
    }

    pub fn cursor<T: Component>(&self) -> Cursor<T> {
        Cursor::new()
    }

    pub fn record(&self, id: EntityId) -> Result<&EntityRecord, StoreError> {
        self.records.get(&id).ok_or(StoreError::NotFound(id))
    }

    pub fn kind(&self, id: EntityId) -> Result<EntityKind, StoreError> {
        self.record(id).map(|r| r.kind)
    }

    /// Freeze an entity until it is repaired.
    pub fn set_fault(&mut self, id: EntityId, fault: EntityFault) -> Result<(), StoreError> {
        let record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.fault = Some(fault);
        Ok(())
    }

    /// Clear the fault flag. Returns whether the entity had been errored.
    pub fn clear_fault(&mut self, id: EntityId) -> Result<bool, StoreError> {
        let record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(record.fault.take().is_some())
    }

    pub fn is_errored(&self, id: EntityId) -> bool {
        self.records.get(&id).is_some_and(|r| r.is_errored())
    }

    /// Live ids in creation order.
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.records.keys().copied()
    }

    pub fn records(&self) -> impl Iterator<Item = (EntityId, &EntityRecord)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    /// Clone out every component of one entity.
    pub fn components(&self, id: EntityId) -> Result<ComponentSet, StoreError> {
        let record = self.record(id)?;
        Ok(ComponentSet {
            kind: record.kind,
            position: self.positions.get(id).cloned(),
            inventory: self.inventories.get(id).cloned(),
            producer: self.producers.get(id).cloned(),
            consumer: self.consumers.get(id).cloned(),
            mover: self.movers.get(id).cloned(),
            machine_state: self.machine_states.get(id).cloned(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Next id that `create` will hand out.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Compact every table so equal stores serialize to equal bytes.
    pub fn compact(&mut self) {
        self.positions.compact();
        self.inventories.compact();
        self.producers.compact();
        self.consumers.compact();
        self.movers.compact();
        self.machine_states.compact();
    }
}
