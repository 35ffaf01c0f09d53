//! Flow network: connections between entity ports and per-tick resolution
//! of how much of each resource travels along every connection.
//!
//! # Resolution
//!
//! Connections are grouped by resource and split into undirected connected
//! subgraphs, each resolved independently. A subgraph runs at most
//! `iteration_cap` rounds of:
//!
//! 1. **Propose** -- every source splits its remaining offer across its open
//!    outgoing edges in proportion to edge priority, clamped by remaining
//!    edge capacity. Truncation dust and clamped surplus go to edges in
//!    ascending [`ConnectionId`] order.
//! 2. **Accept** -- every destination accepts incoming proposals in
//!    proportion to their size, clamped by its remaining request, with dust
//!    handed out the same way.
//!
//! Offers come from buffers as they stood at the start of the tick, so
//! nothing received during a tick is offered again in that tick and cycles
//! need no special handling.
//!
//! Clamping to capacity is silent and only counted. Missing or corrupt data
//! zeroes the whole subgraph and marks it [`SubgraphStatus::Unsatisfied`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::fixed::{mul_div, Fixed64};
use crate::id::{ConnectionId, EntityId, ResourceTypeId};

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// One port on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub entity: EntityId,
    pub port: u8,
}

impl PortRef {
    pub fn new(entity: EntityId, port: u8) -> Self {
        Self { entity, port }
    }
}

/// A directed edge carrying one resource from one port to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub from: PortRef,
    pub to: PortRef,
    pub resource: ResourceTypeId,
    /// Maximum amount moved per tick.
    pub capacity: Fixed64,
    /// Relative share of a source's offer. At least 1.
    pub priority: u16,
}

/// Parameters for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub from: PortRef,
    pub to: PortRef,
    pub resource: ResourceTypeId,
    pub capacity: Fixed64,
    pub priority: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("connection from {0} to itself")]
    SelfLink(EntityId),
    #[error("port {} of {} already has an {direction:?} {resource:?} connection", .port.port, .port.entity)]
    PortInUse {
        port: PortRef,
        resource: ResourceTypeId,
        direction: PortDirection,
    },
    #[error("connection capacity must be positive, got {0}")]
    BadCapacity(Fixed64),
    #[error("connection priority must be at least 1")]
    ZeroPriority,
    #[error("connection {0} not found")]
    NotFound(ConnectionId),
}

// ---------------------------------------------------------------------------
// Per-tick inputs and outputs
// ---------------------------------------------------------------------------

/// What one `(entity, resource)` node can give and take this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeBuffer {
    pub offer: Fixed64,
    pub request: Fixed64,
    pub corrupt: bool,
}

impl NodeBuffer {
    pub fn new(offer: Fixed64, request: Fixed64) -> Self {
        Self {
            offer,
            request,
            corrupt: false,
        }
    }

    /// A node that takes part in nothing this tick.
    pub fn idle() -> Self {
        Self::new(Fixed64::ZERO, Fixed64::ZERO)
    }

    pub fn corrupt() -> Self {
        Self {
            offer: Fixed64::ZERO,
            request: Fixed64::ZERO,
            corrupt: true,
        }
    }
}

/// Node buffers keyed by entity and resource.
pub type FlowBuffers = BTreeMap<(EntityId, ResourceTypeId), NodeBuffer>;

/// Why a subgraph was zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowFault {
    BadCapacity(ConnectionId),
    MissingBuffer(EntityId),
    CorruptBuffer(EntityId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubgraphStatus {
    /// Every destination received its full request.
    Satisfied,
    /// Supply, capacity or the iteration cap left some request unmet.
    Constrained,
    /// Bad data; nothing moved.
    Unsatisfied(FlowFault),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubgraphReport {
    pub resource: ResourceTypeId,
    pub edges: Vec<ConnectionId>,
    pub status: SubgraphStatus,
    pub transferred: Fixed64,
    pub rounds: u32,
    /// Times a proposal was cut down to an edge's remaining capacity.
    pub capacity_clamps: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowResolution {
    /// Amount moved along every edge, including zeros.
    pub transfers: BTreeMap<ConnectionId, Fixed64>,
    pub subgraphs: Vec<SubgraphReport>,
}

impl FlowResolution {
    pub fn transfer(&self, id: ConnectionId) -> Fixed64 {
        self.transfers.get(&id).copied().unwrap_or(Fixed64::ZERO)
    }

    pub fn total_transferred(&self) -> Fixed64 {
        self.transfers
            .values()
            .fold(Fixed64::ZERO, |acc, v| acc.saturating_add(*v))
    }
}

/// Connected edges of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Subgraph {
    pub resource: ResourceTypeId,
    /// Ascending.
    pub edges: Vec<ConnectionId>,
    pub entities: BTreeSet<EntityId>,
}

// ---------------------------------------------------------------------------
// FlowNetwork
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FlowNetwork {
    next_id: u64,
    connections: BTreeMap<ConnectionId, Connection>,
    outgoing: BTreeMap<(PortRef, ResourceTypeId), ConnectionId>,
    incoming: BTreeMap<(PortRef, ResourceTypeId), ConnectionId>,
    by_entity: BTreeMap<EntityId, BTreeSet<ConnectionId>>,
    subgraphs: Vec<Subgraph>,
    dirty: bool,
}

impl FlowNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted connections, re-checking the port invariant.
    pub fn from_connections(
        next_id: u64,
        connections: impl IntoIterator<Item = Connection>,
    ) -> Result<Self, FlowError> {
        let mut network = Self::new();
        for conn in connections {
            network.check(&ConnectionSpec {
                from: conn.from,
                to: conn.to,
                resource: conn.resource,
                capacity: conn.capacity,
                priority: conn.priority,
            })?;
            network.index(conn);
        }
        network.next_id = next_id.max(network.next_id);
        network.dirty = true;
        Ok(network)
    }

    /// Validate `spec` without adding it.
    pub fn check(&self, spec: &ConnectionSpec) -> Result<(), FlowError> {
        if spec.from.entity == spec.to.entity {
            return Err(FlowError::SelfLink(spec.from.entity));
        }
        if spec.capacity <= Fixed64::ZERO {
            return Err(FlowError::BadCapacity(spec.capacity));
        }
        if spec.priority == 0 {
            return Err(FlowError::ZeroPriority);
        }
        if self.outgoing.contains_key(&(spec.from, spec.resource)) {
            return Err(FlowError::PortInUse {
                port: spec.from,
                resource: spec.resource,
                direction: PortDirection::Outgoing,
            });
        }
        if self.incoming.contains_key(&(spec.to, spec.resource)) {
            return Err(FlowError::PortInUse {
                port: spec.to,
                resource: spec.resource,
                direction: PortDirection::Incoming,
            });
        }
        Ok(())
    }

    fn index(&mut self, conn: Connection) {
        self.next_id = self.next_id.max(conn.id.0 + 1);
        self.outgoing.insert((conn.from, conn.resource), conn.id);
        self.incoming.insert((conn.to, conn.resource), conn.id);
        self.by_entity
            .entry(conn.from.entity)
            .or_default()
            .insert(conn.id);
        self.by_entity.entry(conn.to.entity).or_default().insert(conn.id);
        self.connections.insert(conn.id, conn);
    }

    pub fn connect(&mut self, spec: ConnectionSpec) -> Result<ConnectionId, FlowError> {
        self.check(&spec)?;
        let id = ConnectionId(self.next_id);
        self.index(Connection {
            id,
            from: spec.from,
            to: spec.to,
            resource: spec.resource,
            capacity: spec.capacity,
            priority: spec.priority,
        });
        self.dirty = true;
        Ok(id)
    }

    pub fn disconnect(&mut self, id: ConnectionId) -> Result<Connection, FlowError> {
        let conn = self.connections.remove(&id).ok_or(FlowError::NotFound(id))?;
        self.outgoing.remove(&(conn.from, conn.resource));
        self.incoming.remove(&(conn.to, conn.resource));
        for entity in [conn.from.entity, conn.to.entity] {
            if let Some(set) = self.by_entity.get_mut(&entity) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_entity.remove(&entity);
                }
            }
        }
        self.dirty = true;
        Ok(conn)
    }

    /// Drop every connection touching `entity`, in ascending id order.
    pub fn disconnect_entity(&mut self, entity: EntityId) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = self
            .by_entity
            .get(&entity)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.disconnect(id).ok())
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// All connections in ascending id order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connections_of(&self, entity: EntityId) -> impl Iterator<Item = &Connection> {
        self.by_entity
            .get(&entity)
            .into_iter()
            .flat_map(|ids| ids.iter().filter_map(|id| self.connections.get(id)))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    // -- Subgraphs --

    /// Recompute subgraphs if connections changed since the last refresh.
    pub fn refresh(&mut self) {
        if self.dirty {
            self.subgraphs = compute_subgraphs(&self.connections);
            self.dirty = false;
        }
    }

    /// Subgraphs as of the last [`refresh`](Self::refresh), ordered by
    /// their lowest edge id.
    pub fn subgraphs(&self) -> &[Subgraph] {
        &self.subgraphs
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // -- Resolution --

    /// Resolve this tick's transfers for every subgraph.
    pub fn resolve_tick(&self, buffers: &FlowBuffers, iteration_cap: u32) -> FlowResolution {
        let fresh;
        let subgraphs = if self.dirty {
            fresh = compute_subgraphs(&self.connections);
            &fresh
        } else {
            &self.subgraphs
        };
        self.resolve_subgraphs(subgraphs, buffers, iteration_cap)
    }

    /// Resolve an explicit list of subgraphs. Each is independent, so they
    /// run in parallel when the `parallel` feature is on.
    pub fn resolve_subgraphs(
        &self,
        subgraphs: &[Subgraph],
        buffers: &FlowBuffers,
        iteration_cap: u32,
    ) -> FlowResolution {
        #[cfg(feature = "parallel")]
        let results: Vec<(Vec<(ConnectionId, Fixed64)>, SubgraphReport)> = {
            use rayon::prelude::*;
            subgraphs
                .par_iter()
                .map(|sg| self.resolve_one(sg, buffers, iteration_cap))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let results: Vec<(Vec<(ConnectionId, Fixed64)>, SubgraphReport)> = subgraphs
            .iter()
            .map(|sg| self.resolve_one(sg, buffers, iteration_cap))
            .collect();

        let mut resolution = FlowResolution::default();
        for (transfers, report) in results {
            resolution.transfers.extend(transfers);
            resolution.subgraphs.push(report);
        }
        resolution
    }

    fn resolve_one(
        &self,
        subgraph: &Subgraph,
        buffers: &FlowBuffers,
        iteration_cap: u32,
    ) -> (Vec<(ConnectionId, Fixed64)>, SubgraphReport) {
        let edges: Vec<&Connection> = subgraph
            .edges
            .iter()
            .filter_map(|id| self.connections.get(id))
            .collect();

        if let Some(fault) = validate_subgraph(&edges, subgraph, buffers) {
            tracing::debug!(resource = ?subgraph.resource, ?fault, "flow subgraph zeroed");
            return (
                subgraph.edges.iter().map(|id| (*id, Fixed64::ZERO)).collect(),
                SubgraphReport {
                    resource: subgraph.resource,
                    edges: subgraph.edges.clone(),
                    status: SubgraphStatus::Unsatisfied(fault),
                    transferred: Fixed64::ZERO,
                    rounds: 0,
                    capacity_clamps: 0,
                },
            );
        }

        let mut solver = Solver::new(&edges, subgraph, buffers);
        let rounds = solver.run(iteration_cap);

        let satisfied = solver.request.values().all(|r| *r <= Fixed64::ZERO);
        let transferred = solver
            .moved
            .iter()
            .fold(Fixed64::ZERO, |a, v| a.saturating_add(*v));
        let transfers = edges
            .iter()
            .zip(solver.moved.iter())
            .map(|(e, v)| (e.id, *v))
            .collect();
        (
            transfers,
            SubgraphReport {
                resource: subgraph.resource,
                edges: subgraph.edges.clone(),
                status: if satisfied {
                    SubgraphStatus::Satisfied
                } else {
                    SubgraphStatus::Constrained
                },
                transferred,
                rounds,
                capacity_clamps: solver.clamps,
            },
        )
    }
}

fn validate_subgraph(
    edges: &[&Connection],
    subgraph: &Subgraph,
    buffers: &FlowBuffers,
) -> Option<FlowFault> {
    for edge in edges {
        if edge.capacity <= Fixed64::ZERO || edge.priority == 0 {
            return Some(FlowFault::BadCapacity(edge.id));
        }
    }
    for entity in &subgraph.entities {
        match buffers.get(&(*entity, subgraph.resource)) {
            None => return Some(FlowFault::MissingBuffer(*entity)),
            Some(b) if b.corrupt || b.offer < Fixed64::ZERO || b.request < Fixed64::ZERO => {
                return Some(FlowFault::CorruptBuffer(*entity));
            }
            Some(_) => {}
        }
    }
    None
}

/// Working state for one subgraph.
struct Solver<'a> {
    edges: &'a [&'a Connection],
    offer: BTreeMap<EntityId, Fixed64>,
    request: BTreeMap<EntityId, Fixed64>,
    remaining_cap: Vec<Fixed64>,
    moved: Vec<Fixed64>,
    /// Edge indices grouped by source, ascending edge id within a group.
    by_source: BTreeMap<EntityId, Vec<usize>>,
    by_dest: BTreeMap<EntityId, Vec<usize>>,
    clamps: u32,
}

impl<'a> Solver<'a> {
    fn new(edges: &'a [&'a Connection], subgraph: &Subgraph, buffers: &FlowBuffers) -> Self {
        let mut offer = BTreeMap::new();
        let mut request = BTreeMap::new();
        let mut by_source: BTreeMap<EntityId, Vec<usize>> = BTreeMap::new();
        let mut by_dest: BTreeMap<EntityId, Vec<usize>> = BTreeMap::new();
        for (i, edge) in edges.iter().enumerate() {
            by_source.entry(edge.from.entity).or_default().push(i);
            by_dest.entry(edge.to.entity).or_default().push(i);
        }
        for entity in &subgraph.entities {
            let node = buffers
                .get(&(*entity, subgraph.resource))
                .copied()
                .unwrap_or_else(NodeBuffer::idle);
            if by_source.contains_key(entity) {
                offer.insert(*entity, node.offer);
            }
            if by_dest.contains_key(entity) {
                request.insert(*entity, node.request);
            }
        }
        Self {
            edges,
            offer,
            request,
            remaining_cap: edges.iter().map(|e| e.capacity).collect(),
            moved: vec![Fixed64::ZERO; edges.len()],
            by_source,
            by_dest,
            clamps: 0,
        }
    }

    fn is_open(&self, i: usize) -> bool {
        let dest = self.edges[i].to.entity;
        self.remaining_cap[i] > Fixed64::ZERO
            && self.request.get(&dest).is_some_and(|r| *r > Fixed64::ZERO)
    }

    /// Run up to `cap` rounds. Returns the number of rounds that moved
    /// something.
    fn run(&mut self, cap: u32) -> u32 {
        let mut rounds = 0;
        for _ in 0..cap.max(1) {
            let (proposals, clamps) = self.propose();
            self.clamps += clamps;
            let accepted = self.accept(&proposals);
            let mut any = false;
            for (i, amount) in accepted.iter().enumerate() {
                if *amount <= Fixed64::ZERO {
                    continue;
                }
                any = true;
                let edge = self.edges[i];
                self.moved[i] += *amount;
                self.remaining_cap[i] -= *amount;
                if let Some(o) = self.offer.get_mut(&edge.from.entity) {
                    *o -= *amount;
                }
                if let Some(r) = self.request.get_mut(&edge.to.entity) {
                    *r -= *amount;
                }
            }
            if !any {
                break;
            }
            rounds += 1;
        }
        rounds
    }

    fn propose(&self) -> (Vec<Fixed64>, u32) {
        let mut proposals = vec![Fixed64::ZERO; self.edges.len()];
        let mut clamps = 0;
        for (source, edge_ids) in &self.by_source {
            let offer = self.offer.get(source).copied().unwrap_or(Fixed64::ZERO);
            if offer <= Fixed64::ZERO {
                continue;
            }
            let open: Vec<usize> = edge_ids.iter().copied().filter(|i| self.is_open(*i)).collect();
            if open.is_empty() {
                continue;
            }
            let total_weight: u32 = open.iter().map(|i| u32::from(self.edges[*i].priority)).sum();
            let total_weight = Fixed64::from_num(total_weight);
            let mut handed = Fixed64::ZERO;
            for &i in &open {
                let weight = Fixed64::from_num(self.edges[i].priority);
                let share = mul_div(offer, weight, total_weight).unwrap_or(Fixed64::ZERO);
                let cap = self.remaining_cap[i];
                let p = if share > cap {
                    clamps += 1;
                    cap
                } else {
                    share
                };
                proposals[i] = p;
                handed += p;
            }
            // Dust and clamped surplus, lowest edge id first.
            let mut left = offer - handed;
            for &i in &open {
                if left <= Fixed64::ZERO {
                    break;
                }
                let room = self.remaining_cap[i] - proposals[i];
                let extra = left.min(room);
                if extra > Fixed64::ZERO {
                    proposals[i] += extra;
                    left -= extra;
                }
            }
        }
        (proposals, clamps)
    }

    fn accept(&self, proposals: &[Fixed64]) -> Vec<Fixed64> {
        let mut accepted = vec![Fixed64::ZERO; self.edges.len()];
        for (dest, edge_ids) in &self.by_dest {
            let request = self.request.get(dest).copied().unwrap_or(Fixed64::ZERO);
            if request <= Fixed64::ZERO {
                continue;
            }
            // Raw bits in i128, so merging large offers cannot overflow.
            let total: i128 = edge_ids
                .iter()
                .map(|i| i128::from(proposals[*i].to_bits()))
                .sum();
            if total <= 0 {
                continue;
            }
            let wanted = i128::from(request.to_bits());
            if total <= wanted {
                for &i in edge_ids {
                    accepted[i] = proposals[i];
                }
                continue;
            }
            let mut taken = Fixed64::ZERO;
            for &i in edge_ids {
                // At most `request`, so it always fits.
                let bits = i128::from(proposals[i].to_bits()) * wanted / total;
                let share = i64::try_from(bits).map_or(Fixed64::ZERO, Fixed64::from_bits);
                accepted[i] = share;
                taken += share;
            }
            let mut left = request - taken;
            for &i in edge_ids {
                if left <= Fixed64::ZERO {
                    break;
                }
                let extra = left.min(proposals[i] - accepted[i]);
                if extra > Fixed64::ZERO {
                    accepted[i] += extra;
                    left -= extra;
                }
            }
        }
        accepted
    }
}

/// Union-find over `(resource, entity)` nodes.
fn compute_subgraphs(connections: &BTreeMap<ConnectionId, Connection>) -> Vec<Subgraph> {
    let mut by_resource: BTreeMap<ResourceTypeId, Vec<&Connection>> = BTreeMap::new();
    for conn in connections.values() {
        by_resource.entry(conn.resource).or_default().push(conn);
    }

    let mut out = Vec::new();
    for (resource, edges) in by_resource {
        let mut index: BTreeMap<EntityId, usize> = BTreeMap::new();
        for e in &edges {
            let n = index.len();
            index.entry(e.from.entity).or_insert(n);
            let n = index.len();
            index.entry(e.to.entity).or_insert(n);
        }
        let mut parent: Vec<usize> = (0..index.len()).collect();
        for e in &edges {
            let a = find(&mut parent, index[&e.from.entity]);
            let b = find(&mut parent, index[&e.to.entity]);
            if a != b {
                parent[a.max(b)] = a.min(b);
            }
        }
        let mut groups: BTreeMap<usize, Subgraph> = BTreeMap::new();
        for e in &edges {
            let root = find(&mut parent, index[&e.from.entity]);
            let group = groups.entry(root).or_insert_with(|| Subgraph {
                resource,
                edges: Vec::new(),
                entities: BTreeSet::new(),
            });
            group.edges.push(e.id);
            group.entities.insert(e.from.entity);
            group.entities.insert(e.to.entity);
        }
        out.extend(groups.into_values());
    }
    out.sort_by_key(|sg| sg.edges.first().copied());
    out
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}
