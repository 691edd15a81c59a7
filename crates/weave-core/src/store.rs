//! Local reactive store.
//!
//! The render-ready copy of the document. It is written by exactly two
//! paths: optimistic local actions and the sync bridge. Both carry a
//! [`Stamp`] per write, and every field keeps the stamp of its current
//! value, so replaying or reordering writes cannot regress state.

use crate::crdt::Stamp;
use crate::model::{
    Binding, BindingField, BindingId, Connection, ConnectionField, ConnectionId, ConnectionPatch, Entity, Node,
    NodeField, NodeId, NodePatch, Terminal, Tracked, UserId, ViewportField, ViewportState,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),
}

pub type SubscriberId = u64;

/// What changed in one store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreDelta {
    NodeUpserted(NodeId),
    NodeRemoved(NodeId),
    ConnectionUpserted(ConnectionId),
    ConnectionRemoved(ConnectionId),
    BindingUpserted(BindingId),
    BindingRemoved(BindingId),
    ViewportChanged(UserId),
    SelectionChanged,
}

/// Full, serializable view of the live canvas.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CanvasSnapshot {
    pub revision: u64,
    /// Sorted by z-index, then id.
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub bindings: Vec<Binding>,
    pub viewports: Vec<ViewportState>,
    pub selection: Vec<NodeId>,
}

enum Subscriber {
    Delta(Box<dyn FnMut(&[StoreDelta])>),
    Snapshot(Box<dyn FnMut(&CanvasSnapshot)>),
}

/// Canonical local state of nodes, connections, bindings, viewports and
/// the selection.
pub struct LocalStore {
    nodes: HashMap<NodeId, Tracked<Node>>,
    connections: HashMap<ConnectionId, Tracked<Connection>>,
    bindings: HashMap<BindingId, Tracked<Binding>>,
    viewports: HashMap<UserId, Tracked<ViewportState>>,
    selection: BTreeSet<NodeId>,
    min_scale: f64,
    max_scale: f64,
    subscribers: Vec<(SubscriberId, Subscriber)>,
    next_subscriber: SubscriberId,
    revision: u64,
}

/// Merge stamped fields into one entity. Returns `Some(live)` if anything
/// changed, where `live` says whether the entity is live afterwards.
fn merge_fields<E: Entity>(
    map: &mut HashMap<E::Id, Tracked<E>>,
    id: E::Id,
    fields: impl IntoIterator<Item = (E::Field, Stamp)>,
) -> Option<bool> {
    let tracked = map.entry(id.clone()).or_insert_with(|| Tracked::blank(id));
    let mut changed = false;
    for (field, stamp) in fields {
        changed |= tracked.merge(field, stamp);
    }
    changed.then(|| !tracked.is_deleted())
}

fn stamped<F>(fields: Vec<F>, stamp: Stamp) -> impl Iterator<Item = (F, Stamp)> {
    fields.into_iter().map(move |f| (f, stamp))
}

impl LocalStore {
    pub fn new(min_scale: f64, max_scale: f64) -> Self {
        Self {
            nodes: HashMap::new(),
            connections: HashMap::new(),
            bindings: HashMap::new(),
            viewports: HashMap::new(),
            selection: BTreeSet::new(),
            min_scale,
            max_scale,
            subscribers: Vec::new(),
            next_subscriber: 1,
            revision: 0,
        }
    }

    /// Bumped on every mutation that changed something.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    // --- Nodes ---

    pub fn add_node(&mut self, node: Node, stamp: Stamp) -> bool {
        let id = node.id;
        let outcome = merge_fields(&mut self.nodes, id, stamped(node.fields(), stamp));
        self.finish_node(id, outcome)
    }

    pub fn update_node(&mut self, id: NodeId, patch: &NodePatch, stamp: Stamp) -> Result<bool, StoreError> {
        if self.node(id).is_none() {
            return Err(StoreError::UnknownEntity(format!("node {}", id)));
        }
        let outcome = merge_fields(&mut self.nodes, id, stamped(patch.fields(), stamp));
        Ok(self.finish_node(id, outcome))
    }

    /// Tombstone a node. Connections bound to it are left to the caller,
    /// see [`crate::routing::cascade_targets`].
    pub fn delete_node(&mut self, id: NodeId, stamp: Stamp) -> bool {
        let outcome = merge_fields(&mut self.nodes, id, [(NodeField::Deleted(true), stamp)]);
        self.finish_node(id, outcome)
    }

    /// Merge fields decoded from the document. No validation: the store
    /// mirrors whatever the document holds.
    pub fn apply_node_fields(&mut self, id: NodeId, fields: Vec<(NodeField, Stamp)>) -> bool {
        let outcome = merge_fields(&mut self.nodes, id, fields);
        self.finish_node(id, outcome)
    }

    fn finish_node(&mut self, id: NodeId, outcome: Option<bool>) -> bool {
        match outcome {
            Some(true) => {
                self.emit(vec![StoreDelta::NodeUpserted(id)]);
                true
            }
            Some(false) => {
                let mut deltas = vec![StoreDelta::NodeRemoved(id)];
                if self.selection.remove(&id) {
                    deltas.push(StoreDelta::SelectionChanged);
                }
                self.emit(deltas);
                true
            }
            None => false,
        }
    }

    // --- Connections ---

    /// Both endpoints must be distinct, existing, non-deleted nodes.
    pub fn validate_endpoints(&self, start: NodeId, end: NodeId) -> Result<(), StoreError> {
        if start == end {
            return Err(StoreError::InvalidConnection(format!("node {} connected to itself", start)));
        }
        for id in [start, end] {
            if self.node(id).is_none() {
                return Err(StoreError::InvalidConnection(format!("node {} is missing or deleted", id)));
            }
        }
        Ok(())
    }

    pub fn add_connection(&mut self, connection: Connection, stamp: Stamp) -> Result<bool, StoreError> {
        self.validate_endpoints(connection.start_node, connection.end_node)?;
        let id = connection.id;
        let outcome = merge_fields(&mut self.connections, id, stamped(connection.fields(), stamp));
        Ok(self.finish_connection(id, outcome))
    }

    pub fn update_connection(
        &mut self,
        id: ConnectionId,
        patch: &ConnectionPatch,
        stamp: Stamp,
    ) -> Result<bool, StoreError> {
        if self.connection(id).is_none() {
            return Err(StoreError::UnknownEntity(format!("connection {}", id)));
        }
        let outcome = merge_fields(&mut self.connections, id, stamped(patch.fields(), stamp));
        Ok(self.finish_connection(id, outcome))
    }

    pub fn delete_connection(&mut self, id: ConnectionId, stamp: Stamp) -> bool {
        let outcome = merge_fields(&mut self.connections, id, [(ConnectionField::Deleted(true), stamp)]);
        self.finish_connection(id, outcome)
    }

    pub fn apply_connection_fields(&mut self, id: ConnectionId, fields: Vec<(ConnectionField, Stamp)>) -> bool {
        let outcome = merge_fields(&mut self.connections, id, fields);
        self.finish_connection(id, outcome)
    }

    fn finish_connection(&mut self, id: ConnectionId, outcome: Option<bool>) -> bool {
        match outcome {
            Some(live) => {
                let delta = if live {
                    StoreDelta::ConnectionUpserted(id)
                } else {
                    StoreDelta::ConnectionRemoved(id)
                };
                self.emit(vec![delta]);
                true
            }
            None => false,
        }
    }

    // --- Bindings ---

    pub fn add_binding(&mut self, binding: Binding, stamp: Stamp) -> Result<bool, StoreError> {
        if self.connection(binding.connection).is_none() {
            return Err(StoreError::InvalidConnection(format!(
                "binding {} targets missing connection {}",
                binding.id, binding.connection
            )));
        }
        if self.node(binding.node).is_none() {
            return Err(StoreError::InvalidConnection(format!(
                "binding {} targets missing node {}",
                binding.id, binding.node
            )));
        }
        let id = binding.id;
        let outcome = merge_fields(&mut self.bindings, id, stamped(binding.fields(), stamp));
        Ok(self.finish_binding(id, outcome))
    }

    pub fn delete_binding(&mut self, id: BindingId, stamp: Stamp) -> bool {
        let outcome = merge_fields(&mut self.bindings, id, [(BindingField::Deleted(true), stamp)]);
        self.finish_binding(id, outcome)
    }

    pub fn apply_binding_fields(&mut self, id: BindingId, fields: Vec<(BindingField, Stamp)>) -> bool {
        let outcome = merge_fields(&mut self.bindings, id, fields);
        self.finish_binding(id, outcome)
    }

    fn finish_binding(&mut self, id: BindingId, outcome: Option<bool>) -> bool {
        match outcome {
            Some(live) => {
                let delta = if live {
                    StoreDelta::BindingUpserted(id)
                } else {
                    StoreDelta::BindingRemoved(id)
                };
                self.emit(vec![delta]);
                true
            }
            None => false,
        }
    }

    // --- Viewports ---

    /// Record a user's viewport. Scale is clamped to the configured range.
    pub fn set_viewport(&mut self, viewport: ViewportState, stamp: Stamp) -> bool {
        let viewport = viewport.clamped(self.min_scale, self.max_scale);
        let owner = viewport.owner.clone();
        let changed = merge_fields(&mut self.viewports, owner.clone(), stamped(viewport.fields(), stamp)).is_some();
        if changed {
            self.emit(vec![StoreDelta::ViewportChanged(owner)]);
        }
        changed
    }

    pub fn apply_viewport_fields(&mut self, owner: UserId, fields: Vec<(ViewportField, Stamp)>) -> bool {
        let (min, max) = (self.min_scale, self.max_scale);
        let fields = fields.into_iter().map(|(field, stamp)| match field {
            ViewportField::Scale(s) if s.is_finite() => (ViewportField::Scale(s.clamp(min, max)), stamp),
            ViewportField::Scale(_) => (ViewportField::Scale(1.0_f64.clamp(min, max)), stamp),
            other => (other, stamp),
        });
        let changed = merge_fields(&mut self.viewports, owner.clone(), fields).is_some();
        if changed {
            self.emit(vec![StoreDelta::ViewportChanged(owner)]);
        }
        changed
    }

    pub fn viewport(&self, owner: &str) -> Option<&ViewportState> {
        self.viewports.get(owner).map(Tracked::get)
    }

    pub fn scale_limits(&self) -> (f64, f64) {
        (self.min_scale, self.max_scale)
    }

    // --- Selection ---

    /// Select nodes. Ids that are not live nodes are ignored. Without
    /// `additive` the previous selection is replaced.
    pub fn select(&mut self, ids: &[NodeId], additive: bool) -> bool {
        let mut next = if additive { self.selection.clone() } else { BTreeSet::new() };
        next.extend(ids.iter().copied().filter(|id| self.node(*id).is_some()));
        if next == self.selection {
            return false;
        }
        self.selection = next;
        self.emit(vec![StoreDelta::SelectionChanged]);
        true
    }

    pub fn clear_selection(&mut self) -> bool {
        if self.selection.is_empty() {
            return false;
        }
        self.selection.clear();
        self.emit(vec![StoreDelta::SelectionChanged]);
        true
    }

    pub fn selection(&self) -> &BTreeSet<NodeId> {
        &self.selection
    }

    pub fn is_selected(&self, id: NodeId) -> bool {
        self.selection.contains(&id)
    }

    // --- Queries ---

    /// A live node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id).filter(|t| !t.is_deleted()).map(Tracked::get)
    }

    /// Tracked state of a node, tombstoned or not.
    pub fn tracked_node(&self, id: NodeId) -> Option<&Tracked<Node>> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|t| !t.is_deleted()).map(Tracked::get)
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    /// A live connection whose endpoints are both live.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections
            .get(&id)
            .map(Tracked::get)
            .filter(|c| self.is_connection_live(c))
    }

    pub fn tracked_connection(&self, id: ConnectionId) -> Option<&Tracked<Connection>> {
        self.connections.get(&id)
    }

    fn is_connection_live(&self, connection: &Connection) -> bool {
        !connection.deleted && self.node(connection.start_node).is_some() && self.node(connection.end_node).is_some()
    }

    /// Every live connection. Never yields one with a tombstoned endpoint.
    pub fn connections(&self) -> Vec<&Connection> {
        self.connections
            .values()
            .map(Tracked::get)
            .filter(|c| self.is_connection_live(c))
            .collect()
    }

    /// Connections not yet tombstoned with an endpoint that is known to be
    /// deleted. Left behind when a delete races a connect on another
    /// replica. An endpoint that has not arrived yet does not count: the
    /// connection stays hidden until it does.
    pub fn dangling_connections(&self) -> Vec<ConnectionId> {
        let tombstoned = |id: NodeId| self.nodes.get(&id).is_some_and(Tracked::is_deleted);
        self.connections
            .values()
            .map(Tracked::get)
            .filter(|c| !c.deleted && (tombstoned(c.start_node) || tombstoned(c.end_node)))
            .map(|c| c.id)
            .collect()
    }

    /// Non-deleted connections touching a node, whether or not the other
    /// endpoint is live.
    pub fn connections_for_node(&self, node: NodeId) -> Vec<&Connection> {
        self.connections
            .values()
            .map(Tracked::get)
            .filter(|c| !c.deleted && c.touches(node))
            .collect()
    }

    pub fn binding(&self, id: BindingId) -> Option<&Binding> {
        self.bindings.get(&id).filter(|t| !t.is_deleted()).map(Tracked::get)
    }

    pub fn bindings_for_connection(&self, connection: ConnectionId) -> Vec<&Binding> {
        self.bindings
            .values()
            .map(Tracked::get)
            .filter(|b| !b.deleted && b.connection == connection)
            .collect()
    }

    pub fn bindings_for_node(&self, node: NodeId) -> Vec<&Binding> {
        self.bindings
            .values()
            .map(Tracked::get)
            .filter(|b| !b.deleted && b.node == node)
            .collect()
    }

    /// The live binding for one end of a connection. With several (a
    /// concurrent rebind) the lowest id wins so every replica agrees.
    pub fn binding_for(&self, connection: ConnectionId, terminal: Terminal) -> Option<&Binding> {
        self.bindings
            .values()
            .map(Tracked::get)
            .filter(|b| !b.deleted && b.connection == connection && b.terminal == terminal)
            .min_by_key(|b| b.id)
    }

    pub fn snapshot(&self) -> CanvasSnapshot {
        let mut nodes: Vec<Node> = self.nodes().cloned().collect();
        nodes.sort_by_key(|n| (n.z_index, n.id));
        let mut connections: Vec<Connection> = self.connections().into_iter().cloned().collect();
        connections.sort_by_key(|c| (c.z_index, c.id));
        let mut bindings: Vec<Binding> = self
            .bindings
            .values()
            .map(Tracked::get)
            .filter(|b| !b.deleted)
            .cloned()
            .collect();
        bindings.sort_by_key(|b| b.id);
        let mut viewports: Vec<ViewportState> = self.viewports.values().map(Tracked::get).cloned().collect();
        viewports.sort_by(|a, b| a.owner.cmp(&b.owner));
        CanvasSnapshot {
            revision: self.revision,
            nodes,
            connections,
            bindings,
            viewports,
            selection: self.selection.iter().copied().collect(),
        }
    }

    // --- Subscriptions ---

    /// Called with the deltas of every mutation. Callbacks run while the
    /// store is borrowed and must not reach back into it.
    pub fn subscribe_deltas(&mut self, callback: impl FnMut(&[StoreDelta]) + 'static) -> SubscriberId {
        self.add_subscriber(Subscriber::Delta(Box::new(callback)))
    }

    /// Called with a full snapshot after every mutation (e.g. a minimap).
    pub fn subscribe_snapshots(&mut self, callback: impl FnMut(&CanvasSnapshot) + 'static) -> SubscriberId {
        self.add_subscriber(Subscriber::Snapshot(Box::new(callback)))
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    fn add_subscriber(&mut self, subscriber: Subscriber) -> SubscriberId {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.subscribers.push((id, subscriber));
        id
    }

    fn emit(&mut self, deltas: Vec<StoreDelta>) {
        self.revision += 1;
        if self.subscribers.is_empty() {
            return;
        }
        let wants_snapshot = self
            .subscribers
            .iter()
            .any(|(_, s)| matches!(s, Subscriber::Snapshot(_)));
        let snapshot = wants_snapshot.then(|| self.snapshot());
        for (_, subscriber) in self.subscribers.iter_mut() {
            match subscriber {
                Subscriber::Delta(callback) => callback(deltas.as_slice()),
                Subscriber::Snapshot(callback) => {
                    if let Some(ref snapshot) = snapshot {
                        callback(snapshot);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("nodes", &self.nodes.len())
            .field("connections", &self.connections.len())
            .field("bindings", &self.bindings.len())
            .field("selection", &self.selection)
            .field("revision", &self.revision)
            .finish()
    }
}
