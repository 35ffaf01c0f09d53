//! Entity placement and its validation.
//!
//! A [`Placement`] is an entity's full component set plus the connections
//! it should be linked with. Placements are checked against the store, the
//! spatial index and the flow network before anything is written, so a
//! rejected placement leaves every structure untouched.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::component::{ComponentSet, EntityKind, Inventory};
use crate::fixed::Fixed64;
use crate::flow::{ConnectionSpec, FlowError, FlowNetwork, PortRef};
use crate::id::{ConnectionId, EntityId, ResourceTypeId};
use crate::spatial::{OutOfBoundsError, SpatialError, SpatialIndex, TilePos};
use crate::store::EntityStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The other end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkTarget {
    Existing(EntityId),
    /// An earlier placement in the same chunk seed, by index.
    Seed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkDirection {
    /// Resource flows from the placed entity to the target.
    Out,
    /// Resource flows from the target into the placed entity.
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub direction: LinkDirection,
    pub port: u8,
    pub target: LinkTarget,
    pub target_port: u8,
    pub resource: ResourceTypeId,
    pub capacity: Fixed64,
    pub priority: u16,
}

impl LinkSpec {
    /// Port-0 to port-0 link with priority 1.
    pub fn simple(
        direction: LinkDirection,
        target: EntityId,
        resource: ResourceTypeId,
        capacity: Fixed64,
    ) -> Self {
        Self {
            direction,
            port: 0,
            target: LinkTarget::Existing(target),
            target_port: 0,
            resource,
            capacity,
            priority: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub components: ComponentSet,
    pub links: Vec<LinkSpec>,
}

impl Placement {
    pub fn new(components: ComponentSet) -> Self {
        Self {
            components,
            links: Vec::new(),
        }
    }

    pub fn with_link(mut self, link: LinkSpec) -> Self {
        self.links.push(link);
        self
    }
}

impl From<ComponentSet> for Placement {
    fn from(components: ComponentSet) -> Self {
        Self::new(components)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("placement has no position")]
    MissingPosition,
    #[error(transparent)]
    OutOfBounds(#[from] OutOfBoundsError),
    #[error("tile ({}, {}) is occupied by {by}", .tile.x, .tile.y)]
    Occupied { tile: TilePos, by: EntityId },
    #[error("link target {0} does not exist")]
    UnknownEndpoint(EntityId),
    #[error("link refers to seed {0}, which is not an earlier placement")]
    UnknownSeed(usize),
    #[error("{entity} has no buffer for resource {resource:?}")]
    MissingResourceSlot {
        entity: EntityId,
        resource: ResourceTypeId,
    },
    #[error("invalid link: {0}")]
    Link(#[from] FlowError),
    #[error("invalid components: {0}")]
    Components(String),
}

impl From<SpatialError> for ValidationError {
    fn from(err: SpatialError) -> Self {
        match err {
            SpatialError::OutOfBounds(e) => ValidationError::OutOfBounds(e),
            SpatialError::Occupied { tile, by } => ValidationError::Occupied { tile, by },
            other => ValidationError::Components(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_components(set: &ComponentSet) -> Result<(), ValidationError> {
    fn bad(msg: &str) -> Result<(), ValidationError> {
        Err(ValidationError::Components(msg.to_string()))
    }

    if set.mover.is_some() && set.kind != EntityKind::Unit {
        return bad("only units may carry a Mover");
    }
    if set.kind == EntityKind::Unit && set.mover.is_none() {
        return bad("units need a Mover");
    }
    if let Some(inv) = &set.inventory {
        if inv.buffers.values().any(|b| !b.is_valid()) {
            return bad("buffer amount outside 0..=capacity");
        }
    }
    let has_slot = |resource: ResourceTypeId| {
        set.inventory
            .as_ref()
            .is_some_and(|inv| inv.buffer(resource).is_some())
    };
    if let Some(p) = &set.producer {
        if p.rate < Fixed64::ZERO {
            return bad("producer rate is negative");
        }
        if !has_slot(p.resource) {
            return bad("producer output has no buffer");
        }
        if let Some(ing) = &p.requires {
            if ing.ratio <= Fixed64::ZERO {
                return bad("ingredient ratio must be positive");
            }
            if !has_slot(ing.resource) {
                return bad("producer ingredient has no buffer");
            }
        }
    }
    if let Some(c) = &set.consumer {
        if c.rate < Fixed64::ZERO {
            return bad("consumer rate is negative");
        }
        if !has_slot(c.resource) {
            return bad("consumer input has no buffer");
        }
    }
    Ok(())
}

/// A link with both endpoints resolved to ids.
fn resolve_link(
    link: &LinkSpec,
    own: EntityId,
    seeds: &[EntityId],
) -> Result<ConnectionSpec, ValidationError> {
    let target = match link.target {
        LinkTarget::Existing(id) => id,
        LinkTarget::Seed(index) => *seeds
            .get(index)
            .ok_or(ValidationError::UnknownSeed(index))?,
    };
    let own_port = PortRef::new(own, link.port);
    let other_port = PortRef::new(target, link.target_port);
    let (from, to) = match link.direction {
        LinkDirection::Out => (own_port, other_port),
        LinkDirection::In => (other_port, own_port),
    };
    Ok(ConnectionSpec {
        from,
        to,
        resource: link.resource,
        capacity: link.capacity,
        priority: link.priority,
    })
}

/// Check `placement` as if it were created next. `seeds` resolves
/// [`LinkTarget::Seed`] indices.
pub fn validate(
    placement: &Placement,
    store: &EntityStore,
    spatial: &SpatialIndex,
    flow: &FlowNetwork,
    seeds: &[EntityId],
) -> Result<Vec<ConnectionSpec>, ValidationError> {
    let set = &placement.components;
    let pos = set.position.ok_or(ValidationError::MissingPosition)?.0;
    spatial.check_bounds(pos)?;
    if let Some(by) = spatial.occupant(pos) {
        return Err(ValidationError::Occupied { tile: pos, by });
    }
    check_components(set)?;

    let own = EntityId(store.next_id());
    let own_has_slot = |resource: ResourceTypeId| {
        set.inventory
            .as_ref()
            .is_some_and(|inv| inv.buffer(resource).is_some())
    };

    let mut specs = Vec::with_capacity(placement.links.len());
    let mut used_out = BTreeSet::new();
    let mut used_in = BTreeSet::new();
    for link in &placement.links {
        let spec = resolve_link(link, own, seeds)?;
        let other = if spec.from.entity == own {
            spec.to.entity
        } else {
            spec.from.entity
        };
        if other != own {
            if !store.is_live(other) {
                return Err(ValidationError::UnknownEndpoint(other));
            }
            let other_has_slot = store
                .get::<Inventory>(other)
                .is_ok_and(|inv| inv.buffer(spec.resource).is_some());
            if !other_has_slot {
                return Err(ValidationError::MissingResourceSlot {
                    entity: other,
                    resource: spec.resource,
                });
            }
        }
        if !own_has_slot(spec.resource) {
            return Err(ValidationError::MissingResourceSlot {
                entity: own,
                resource: spec.resource,
            });
        }
        flow.check(&spec)?;
        // Links in one placement must not collide with each other either.
        if !used_out.insert((spec.from, spec.resource)) {
            return Err(FlowError::PortInUse {
                port: spec.from,
                resource: spec.resource,
                direction: crate::flow::PortDirection::Outgoing,
            }
            .into());
        }
        if !used_in.insert((spec.to, spec.resource)) {
            return Err(FlowError::PortInUse {
                port: spec.to,
                resource: spec.resource,
                direction: crate::flow::PortDirection::Incoming,
            }
            .into());
        }
        specs.push(spec);
    }
    Ok(specs)
}

/// Validate, then create the entity, index it and connect its links.
pub fn apply(
    placement: Placement,
    store: &mut EntityStore,
    spatial: &mut SpatialIndex,
    flow: &mut FlowNetwork,
    seeds: &[EntityId],
) -> Result<(EntityId, Vec<ConnectionId>), ValidationError> {
    let specs = validate(&placement, store, spatial, flow, seeds)?;
    let pos = placement
        .components
        .position
        .ok_or(ValidationError::MissingPosition)?
        .0;
    let id = store.create(placement.components);
    spatial.insert(id, pos)?;
    let mut connections = Vec::with_capacity(specs.len());
    for spec in specs {
        connections.push(flow.connect(spec)?);
    }
    Ok((id, connections))
}
