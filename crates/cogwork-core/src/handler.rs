//! Per-entity capability handlers.
//!
//! Handlers read the batch-start state through a [`HandlerContext`] and
//! write only to the [`EntityScratch`] copy of the entity they are given.
//! The scheduler commits scratches in entity-id order once every work unit
//! of the batch has finished.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use crate::component::{
    Capability, Consumer, EntityFault, Inventory, MachineState, MachineStatus, Mover, Position,
    Producer,
};
use crate::fixed::{mul_div, Fixed64, Ticks};
use crate::id::{EntityId, ResourceTypeId};
use crate::spatial::{SpatialIndex, TilePos};
use crate::store::EntityStore;

// ---------------------------------------------------------------------------
// Scratch and context
// ---------------------------------------------------------------------------

/// Writable copy of one entity's mutable components.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityScratch {
    pub id: EntityId,
    pub position: Option<TilePos>,
    pub inventory: Option<Inventory>,
    pub mover: Option<Mover>,
    pub machine_state: Option<MachineState>,
    /// Most severe status reported by a handler this tick.
    pub status: Option<MachineStatus>,
}

impl EntityScratch {
    pub fn load(store: &EntityStore, id: EntityId) -> Self {
        Self {
            id,
            position: store.get::<Position>(id).ok().map(|p| p.0),
            inventory: store.get::<Inventory>(id).ok().cloned(),
            mover: store.get::<Mover>(id).ok().cloned(),
            machine_state: store.get::<MachineState>(id).ok().cloned(),
            status: None,
        }
    }

    /// Keep the more severe of the current and the reported status.
    pub fn report_status(&mut self, status: MachineStatus) {
        let rank = |s: MachineStatus| match s {
            MachineStatus::Idle => 0,
            MachineStatus::Running => 1,
            MachineStatus::Starved => 2,
            MachineStatus::OutputBlocked => 3,
        };
        if self.status.is_none_or(|cur| rank(status) > rank(cur)) {
            self.status = Some(status);
        }
    }

    pub fn inventory_mut(&mut self) -> Result<&mut Inventory, EntityFault> {
        self.inventory
            .as_mut()
            .ok_or_else(|| EntityFault::MissingComponent("Inventory".into()))
    }
}

/// Tiles claimed and vacated by movers within one work unit.
#[derive(Debug, Default)]
pub struct TileClaims {
    claimed: BTreeSet<TilePos>,
    vacated: BTreeSet<TilePos>,
}

impl TileClaims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self, tile: TilePos) -> bool {
        self.claimed.contains(&tile)
    }

    pub fn is_vacated(&self, tile: TilePos) -> bool {
        self.vacated.contains(&tile)
    }

    /// Record a move from `from` to `to`.
    pub fn claim(&mut self, from: TilePos, to: TilePos) {
        self.claimed.insert(to);
        self.vacated.insert(from);
    }
}

/// Read access to the batch-start state.
pub struct HandlerContext<'a> {
    pub tick: Ticks,
    pub store: &'a EntityStore,
    pub spatial: &'a SpatialIndex,
    pub claims: &'a mut TileClaims,
}

impl HandlerContext<'_> {
    /// Free for a move: in bounds, unoccupied at batch start (or vacated
    /// earlier in this work unit) and not claimed by another mover.
    pub fn tile_free(&self, tile: TilePos) -> bool {
        if !self.spatial.in_bounds(tile) || self.claims.is_claimed(tile) {
            return false;
        }
        match self.spatial.occupant(tile) {
            None => true,
            Some(_) => self.claims.is_vacated(tile),
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateHandler
// ---------------------------------------------------------------------------

pub trait UpdateHandler: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    fn update(
        &self,
        ctx: &mut HandlerContext<'_>,
        scratch: &mut EntityScratch,
    ) -> Result<(), EntityFault>;
}

/// Handlers in run order.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn UpdateHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Consumer, then producer, then mover.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ConsumerHandler));
        registry.register(Arc::new(ProducerHandler));
        registry.register(Arc::new(MoverHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn UpdateHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers that apply to an entity with `caps`.
    pub fn for_capabilities<'a>(
        &'a self,
        caps: &'a [Capability],
    ) -> impl Iterator<Item = &'a Arc<dyn UpdateHandler>> + 'a {
        self.handlers
            .iter()
            .filter(move |h| caps.contains(&h.capability()))
    }
}

/// Capabilities implied by the components an entity carries in `store`.
pub fn capabilities_of(store: &EntityStore, id: EntityId) -> Vec<Capability> {
    let mut caps = Vec::new();
    if store.has::<Consumer>(id) {
        caps.push(Capability::Consumer);
    }
    if store.has::<Producer>(id) {
        caps.push(Capability::Producer);
    }
    if store.has::<Mover>(id) {
        caps.push(Capability::Mover);
    }
    caps
}

fn checked_buffer(
    inventory: &Inventory,
    resource: ResourceTypeId,
) -> Result<(), EntityFault> {
    let buffer = inventory
        .buffer(resource)
        .ok_or(EntityFault::MissingBuffer(resource))?;
    if !buffer.is_valid() {
        return Err(EntityFault::CorruptBuffer {
            resource,
            detail: format!("amount {} capacity {}", buffer.amount, buffer.capacity),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Emits a producer's rate into its own buffer, drawing on its ingredient.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerHandler;

impl UpdateHandler for ProducerHandler {
    fn name(&self) -> &str {
        "producer"
    }

    fn capability(&self) -> Capability {
        Capability::Producer
    }

    fn update(
        &self,
        ctx: &mut HandlerContext<'_>,
        scratch: &mut EntityScratch,
    ) -> Result<(), EntityFault> {
        let producer = *ctx
            .store
            .get::<Producer>(scratch.id)
            .map_err(|_| EntityFault::MissingComponent("Producer".into()))?;
        let inventory = scratch.inventory_mut()?;
        checked_buffer(inventory, producer.resource)?;

        let headroom = inventory
            .buffer(producer.resource)
            .map(|b| b.headroom())
            .unwrap_or(Fixed64::ZERO);
        let mut amount = producer.rate.min(headroom);
        let mut starved = false;

        if let Some(ingredient) = producer.requires {
            checked_buffer(inventory, ingredient.resource)?;
            let available = inventory.amount(ingredient.resource);
            let affordable = mul_div(available, Fixed64::ONE, ingredient.ratio)
                .unwrap_or(Fixed64::ZERO);
            if affordable < amount {
                amount = affordable;
                starved = true;
            }
            let needed = amount
                .checked_mul(ingredient.ratio)
                .unwrap_or(available)
                .min(available);
            inventory.withdraw(ingredient.resource, needed);
        }

        let produced = inventory.deposit(producer.resource, amount);
        let blocked = headroom < producer.rate;
        let status = if blocked && (!starved || produced == headroom) {
            MachineStatus::OutputBlocked
        } else if starved {
            MachineStatus::Starved
        } else if produced > Fixed64::ZERO {
            MachineStatus::Running
        } else {
            MachineStatus::Idle
        };
        if let Some(state) = scratch.machine_state.as_mut() {
            state.produced_total += produced;
        }
        scratch.report_status(status);
        Ok(())
    }
}

/// Drains a consumer's rate from its own buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerHandler;

impl UpdateHandler for ConsumerHandler {
    fn name(&self) -> &str {
        "consumer"
    }

    fn capability(&self) -> Capability {
        Capability::Consumer
    }

    fn update(
        &self,
        ctx: &mut HandlerContext<'_>,
        scratch: &mut EntityScratch,
    ) -> Result<(), EntityFault> {
        let consumer = *ctx
            .store
            .get::<Consumer>(scratch.id)
            .map_err(|_| EntityFault::MissingComponent("Consumer".into()))?;
        let inventory = scratch.inventory_mut()?;
        checked_buffer(inventory, consumer.resource)?;

        let taken = inventory.withdraw(consumer.resource, consumer.rate);
        if let Some(state) = scratch.machine_state.as_mut() {
            state.consumed_total += taken;
        }
        scratch.report_status(if taken < consumer.rate {
            MachineStatus::Starved
        } else {
            MachineStatus::Running
        });
        Ok(())
    }
}

/// Steps a unit one tile along its path when its cooldown allows.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoverHandler;

impl UpdateHandler for MoverHandler {
    fn name(&self) -> &str {
        "mover"
    }

    fn capability(&self) -> Capability {
        Capability::Mover
    }

    fn update(
        &self,
        ctx: &mut HandlerContext<'_>,
        scratch: &mut EntityScratch,
    ) -> Result<(), EntityFault> {
        let at = scratch
            .position
            .ok_or_else(|| EntityFault::MissingComponent("Position".into()))?;
        let mover = scratch
            .mover
            .as_mut()
            .ok_or_else(|| EntityFault::MissingComponent("Mover".into()))?;
        if mover.ticks_per_step == 0 {
            return Err(EntityFault::InvalidTransition(
                "mover with zero ticks per step".into(),
            ));
        }

        if mover.cooldown > 0 {
            mover.cooldown -= 1;
            return Ok(());
        }
        let Some(&next) = mover.path.first() else {
            mover.stalled_ticks = 0;
            return Ok(());
        };
        if next.manhattan_distance(&at) != 1 || !ctx.tile_free(next) {
            mover.stalled_ticks = mover.stalled_ticks.saturating_add(1);
            return Ok(());
        }
        ctx.claims.claim(at, next);
        mover.path.remove(0);
        mover.cooldown = mover.ticks_per_step - 1;
        mover.stalled_ticks = 0;
        scratch.position = Some(next);
        Ok(())
    }
}
