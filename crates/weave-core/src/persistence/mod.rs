//! Durable storage of a workspace.
//!
//! The engine is local-first: nothing waits on the gateway. Writes are
//! handed to a [`WriteScheduler`], which debounces them per entity and
//! retries failures in the background.

mod memory;
mod scheduler;

pub use memory::MemoryGateway;
pub use scheduler::{FlushReport, RetryPolicy, SaveStatus, WriteScheduler};

use crate::crdt::{Collection, EntityKey};
use crate::model::{
    AnchorSide, Binding, BindingId, Connection, ConnectionId, ConnectionStyle, Node, NodeId, NodeKind, NodeStyle,
    RoutingType, Terminal, UserId, ViewportState,
};
use crate::store::LocalStore;
use kurbo::{Point, Size, Vec2};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistError {
    #[error("Workspace not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage error: {0}")]
    Other(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Boxed future returned by gateway calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: NodeId,
    pub workspace_id: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub kind: NodeKind,
    pub content: String,
    pub style: NodeStyle,
    pub z_index: i64,
    pub created_by: UserId,
    pub created_at: i64,
    pub updated_by: UserId,
    pub updated_at: i64,
}

impl NodeRow {
    pub fn from_node(workspace_id: &str, node: &Node) -> Self {
        Self {
            id: node.id,
            workspace_id: workspace_id.to_string(),
            x: node.position.x,
            y: node.position.y,
            w: node.size.width,
            h: node.size.height,
            kind: node.kind,
            content: node.content.clone(),
            style: node.style.clone(),
            z_index: node.z_index,
            created_by: node.created_by.clone(),
            created_at: node.created_at,
            updated_by: node.updated_by.clone(),
            updated_at: node.updated_at,
        }
    }

    pub fn into_node(self) -> Node {
        Node {
            id: self.id,
            kind: self.kind,
            content: self.content,
            style: self.style,
            z_index: self.z_index,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_by: self.updated_by,
            updated_at: self.updated_at,
            ..Node::new(Point::new(self.x, self.y), Size::new(self.w, self.h))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRow {
    pub id: ConnectionId,
    pub workspace_id: String,
    pub start_node_id: NodeId,
    pub end_node_id: NodeId,
    pub start_anchor: AnchorSide,
    pub end_anchor: AnchorSide,
    #[serde(rename = "type")]
    pub routing: RoutingType,
    pub style: ConnectionStyle,
    pub z_index: i64,
}

impl ConnectionRow {
    pub fn from_connection(workspace_id: &str, conn: &Connection) -> Self {
        Self {
            id: conn.id,
            workspace_id: workspace_id.to_string(),
            start_node_id: conn.start_node,
            end_node_id: conn.end_node,
            start_anchor: conn.start_anchor,
            end_anchor: conn.end_anchor,
            routing: conn.routing,
            style: conn.style.clone(),
            z_index: conn.z_index,
        }
    }

    pub fn into_connection(self) -> Connection {
        Connection {
            id: self.id,
            style: self.style,
            z_index: self.z_index,
            ..Connection::new(self.start_node_id, self.start_anchor, self.end_node_id, self.end_anchor)
                .with_routing(self.routing)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRow {
    pub id: BindingId,
    pub connection_id: ConnectionId,
    pub node_id: NodeId,
    pub terminal: Terminal,
    pub anchor_side: AnchorSide,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl BindingRow {
    pub fn from_binding(binding: &Binding) -> Self {
        Self {
            id: binding.id,
            connection_id: binding.connection,
            node_id: binding.node,
            terminal: binding.terminal,
            anchor_side: binding.anchor,
            offset_x: binding.offset.x,
            offset_y: binding.offset.y,
        }
    }

    pub fn into_binding(self) -> Binding {
        Binding {
            id: self.id,
            offset: Vec2::new(self.offset_x, self.offset_y),
            ..Binding::new(self.connection_id, self.node_id, self.terminal, self.anchor_side)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportRow {
    pub workspace_id: String,
    pub user_id: UserId,
    pub offset_x: f64,
    pub offset_y: f64,
    pub scale: f64,
    pub updated_at: i64,
}

impl ViewportRow {
    pub fn from_viewport(workspace_id: &str, viewport: &ViewportState) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: viewport.owner.clone(),
            offset_x: viewport.offset.x,
            offset_y: viewport.offset.y,
            scale: viewport.scale,
            updated_at: viewport.updated_at,
        }
    }

    pub fn into_viewport(self) -> ViewportState {
        ViewportState {
            updated_at: self.updated_at,
            ..ViewportState::new(self.user_id, Vec2::new(self.offset_x, self.offset_y), self.scale)
        }
    }
}

/// Every persisted row of one workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRows {
    pub nodes: Vec<NodeRow>,
    pub connections: Vec<ConnectionRow>,
    pub bindings: Vec<BindingRow>,
    pub viewports: Vec<ViewportRow>,
}

impl WorkspaceRows {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.connections.is_empty() && self.bindings.is_empty() && self.viewports.is_empty()
    }
}

/// One durable write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    UpsertNode(NodeRow),
    DeleteNode(NodeId),
    UpsertConnection(ConnectionRow),
    DeleteConnection(ConnectionId),
    UpsertBinding(BindingRow),
    DeleteBinding(BindingId),
    SaveViewport(ViewportRow),
}

impl WriteOp {
    /// The entity the write targets. Writes to the same key supersede each
    /// other.
    pub fn key(&self) -> EntityKey {
        match self {
            WriteOp::UpsertNode(row) => EntityKey::node(row.id),
            WriteOp::DeleteNode(id) => EntityKey::node(id),
            WriteOp::UpsertConnection(row) => EntityKey::connection(row.id),
            WriteOp::DeleteConnection(id) => EntityKey::connection(id),
            WriteOp::UpsertBinding(row) => EntityKey::binding(row.id),
            WriteOp::DeleteBinding(id) => EntityKey::binding(id),
            WriteOp::SaveViewport(row) => EntityKey::viewport(&row.user_id),
        }
    }

    /// The write that makes storage match the store's current state of
    /// `key`: an upsert for a live entity, a delete otherwise.
    pub fn capture(store: &LocalStore, workspace_id: &str, key: &EntityKey) -> Option<WriteOp> {
        if key.collection == Collection::Viewports {
            return store
                .viewport(&key.id)
                .map(|vp| WriteOp::SaveViewport(ViewportRow::from_viewport(workspace_id, vp)));
        }
        let id: uuid::Uuid = match key.id.parse() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Not persisting {}: {}", key, e);
                return None;
            }
        };
        let op = match key.collection {
            Collection::Nodes => match store.node(id) {
                Some(node) => WriteOp::UpsertNode(NodeRow::from_node(workspace_id, node)),
                None => WriteOp::DeleteNode(id),
            },
            Collection::Connections => match store.tracked_connection(id).map(|t| t.get()) {
                Some(conn) if !conn.deleted => {
                    WriteOp::UpsertConnection(ConnectionRow::from_connection(workspace_id, conn))
                }
                _ => WriteOp::DeleteConnection(id),
            },
            Collection::Bindings => match store.binding(id) {
                Some(binding) => WriteOp::UpsertBinding(BindingRow::from_binding(binding)),
                None => WriteOp::DeleteBinding(id),
            },
            Collection::Viewports => return None,
        };
        Some(op)
    }
}

/// Durable storage for workspaces.
///
/// Every call is keyed by workspace id and idempotent by entity id, so the
/// scheduler may repeat a write after a failure without harm.
pub trait PersistenceGateway: Send + Sync {
    fn upsert_node(&self, workspace_id: &str, row: &NodeRow) -> BoxFuture<'_, PersistResult<()>>;

    fn delete_node(&self, workspace_id: &str, id: NodeId) -> BoxFuture<'_, PersistResult<()>>;

    fn upsert_connection(&self, workspace_id: &str, row: &ConnectionRow) -> BoxFuture<'_, PersistResult<()>>;

    fn delete_connection(&self, workspace_id: &str, id: ConnectionId) -> BoxFuture<'_, PersistResult<()>>;

    fn upsert_binding(&self, workspace_id: &str, row: &BindingRow) -> BoxFuture<'_, PersistResult<()>>;

    fn delete_binding(&self, workspace_id: &str, id: BindingId) -> BoxFuture<'_, PersistResult<()>>;

    fn save_viewport(&self, workspace_id: &str, row: &ViewportRow) -> BoxFuture<'_, PersistResult<()>>;

    /// Every row stored for a workspace.
    fn load_workspace(&self, workspace_id: &str) -> BoxFuture<'_, PersistResult<WorkspaceRows>>;

    /// Dispatch one write to the matching call.
    fn apply(&self, workspace_id: &str, op: &WriteOp) -> BoxFuture<'_, PersistResult<()>> {
        match op {
            WriteOp::UpsertNode(row) => self.upsert_node(workspace_id, row),
            WriteOp::DeleteNode(id) => self.delete_node(workspace_id, *id),
            WriteOp::UpsertConnection(row) => self.upsert_connection(workspace_id, row),
            WriteOp::DeleteConnection(id) => self.delete_connection(workspace_id, *id),
            WriteOp::UpsertBinding(row) => self.upsert_binding(workspace_id, row),
            WriteOp::DeleteBinding(id) => self.delete_binding(workspace_id, *id),
            WriteOp::SaveViewport(row) => self.save_viewport(workspace_id, row),
        }
    }
}

#[cfg(test)]
pub(crate) fn block_on<F: std::future::Future>(f: F) -> F::Output {
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn dummy_raw_waker() -> RawWaker {
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            dummy_raw_waker()
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }

    let waker = unsafe { Waker::from_raw(dummy_raw_waker()) };
    let mut cx = Context::from_waker(&waker);
    let mut f = std::pin::pin!(f);

    loop {
        if let Poll::Ready(result) = f.as_mut().poll(&mut cx) {
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Stamp;

    fn stamp(time: i64) -> Stamp {
        Stamp { time, counter: 0, peer: 1 }
    }

    #[test]
    fn test_connection_row_uses_type_column() {
        let conn = Connection::new(uuid::Uuid::new_v4(), AnchorSide::Right, uuid::Uuid::new_v4(), AnchorSide::Left)
            .with_routing(RoutingType::Elbow);
        let json = serde_json::to_value(ConnectionRow::from_connection("ws", &conn)).unwrap();
        assert_eq!(json["type"], "elbow");
        assert_eq!(json["start_anchor"], "right");
        assert!(json.get("routing").is_none());
    }

    #[test]
    fn test_rows_restore_entities() {
        let node = Node::new(Point::new(5.0, 6.0), Size::new(70.0, 80.0)).with_content("hi");
        assert_eq!(NodeRow::from_node("ws", &node).into_node(), node);

        let mut binding = Binding::new(uuid::Uuid::new_v4(), node.id, Terminal::End, AnchorSide::Top);
        binding.offset = Vec2::new(3.0, -4.0);
        assert_eq!(BindingRow::from_binding(&binding).into_binding(), binding);
    }

    #[test]
    fn test_capture_follows_store_state() {
        let mut store = LocalStore::new(0.1, 10.0);
        let node = Node::new(Point::ZERO, Size::new(10.0, 10.0));
        store.add_node(node.clone(), stamp(1));

        let key = EntityKey::node(node.id);
        assert!(matches!(WriteOp::capture(&store, "ws", &key), Some(WriteOp::UpsertNode(row)) if row.workspace_id == "ws"));

        store.delete_node(node.id, stamp(2));
        assert_eq!(WriteOp::capture(&store, "ws", &key), Some(WriteOp::DeleteNode(node.id)));
        assert_eq!(WriteOp::capture(&store, "ws", &EntityKey::node("garbage")), None);
        assert_eq!(WriteOp::capture(&store, "ws", &EntityKey::viewport("nobody")), None);
    }
}
