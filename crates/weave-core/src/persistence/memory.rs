//! In-memory gateway.

use super::{
    BindingRow, BoxFuture, ConnectionRow, NodeRow, PersistError, PersistResult, PersistenceGateway, ViewportRow,
    WorkspaceRows,
};
use crate::model::{BindingId, ConnectionId, NodeId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct Tables {
    nodes: BTreeMap<NodeId, NodeRow>,
    connections: BTreeMap<ConnectionId, ConnectionRow>,
    bindings: BTreeMap<BindingId, BindingRow>,
    viewports: BTreeMap<UserId, ViewportRow>,
}

/// In-memory gateway for tests and ephemeral use.
///
/// `fail_next` makes the following writes fail with
/// [`PersistError::Unavailable`], to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    workspaces: RwLock<HashMap<String, Tables>>,
    failures: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` write calls.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of write calls received, failed ones included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write(&self, workspace_id: String, f: impl FnOnce(&mut Tables)) -> PersistResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PersistError::Unavailable("injected failure".to_string()));
        }
        let mut workspaces = self
            .workspaces
            .write()
            .map_err(|e| PersistError::Other(format!("Lock error: {}", e)))?;
        f(workspaces.entry(workspace_id).or_default());
        Ok(())
    }
}

impl PersistenceGateway for MemoryGateway {
    fn upsert_node(&self, workspace_id: &str, row: &NodeRow) -> BoxFuture<'_, PersistResult<()>> {
        let workspace_id = workspace_id.to_string();
        let row = row.clone();
        Box::pin(async move {
            self.write(workspace_id, |t| {
                t.nodes.insert(row.id, row);
            })
        })
    }

    fn delete_node(&self, workspace_id: &str, id: NodeId) -> BoxFuture<'_, PersistResult<()>> {
        let workspace_id = workspace_id.to_string();
        Box::pin(async move {
            self.write(workspace_id, |t| {
                t.nodes.remove(&id);
            })
        })
    }

    fn upsert_connection(&self, workspace_id: &str, row: &ConnectionRow) -> BoxFuture<'_, PersistResult<()>> {
        let workspace_id = workspace_id.to_string();
        let row = row.clone();
        Box::pin(async move {
            self.write(workspace_id, |t| {
                t.connections.insert(row.id, row);
            })
        })
    }

    fn delete_connection(&self, workspace_id: &str, id: ConnectionId) -> BoxFuture<'_, PersistResult<()>> {
        let workspace_id = workspace_id.to_string();
        Box::pin(async move {
            self.write(workspace_id, |t| {
                t.connections.remove(&id);
            })
        })
    }

    fn upsert_binding(&self, workspace_id: &str, row: &BindingRow) -> BoxFuture<'_, PersistResult<()>> {
        let workspace_id = workspace_id.to_string();
        let row = row.clone();
        Box::pin(async move {
            self.write(workspace_id, |t| {
                t.bindings.insert(row.id, row);
            })
        })
    }

    fn delete_binding(&self, workspace_id: &str, id: BindingId) -> BoxFuture<'_, PersistResult<()>> {
        let workspace_id = workspace_id.to_string();
        Box::pin(async move {
            self.write(workspace_id, |t| {
                t.bindings.remove(&id);
            })
        })
    }

    fn save_viewport(&self, workspace_id: &str, row: &ViewportRow) -> BoxFuture<'_, PersistResult<()>> {
        let workspace_id = workspace_id.to_string();
        let row = row.clone();
        Box::pin(async move {
            self.write(workspace_id, |t| {
                t.viewports.insert(row.user_id.clone(), row);
            })
        })
    }

    fn load_workspace(&self, workspace_id: &str) -> BoxFuture<'_, PersistResult<WorkspaceRows>> {
        let workspace_id = workspace_id.to_string();
        Box::pin(async move {
            let workspaces = self
                .workspaces
                .read()
                .map_err(|e| PersistError::Other(format!("Lock error: {}", e)))?;
            let tables = workspaces
                .get(&workspace_id)
                .ok_or_else(|| PersistError::NotFound(workspace_id.clone()))?;
            Ok(WorkspaceRows {
                nodes: tables.nodes.values().cloned().collect(),
                connections: tables.connections.values().cloned().collect(),
                bindings: tables.bindings.values().cloned().collect(),
                viewports: tables.viewports.values().cloned().collect(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;
    use crate::persistence::{WriteOp, block_on};
    use kurbo::{Point, Size};

    fn row(workspace: &str) -> NodeRow {
        NodeRow::from_node(workspace, &Node::new(Point::new(1.0, 2.0), Size::new(30.0, 40.0)))
    }

    #[test]
    fn test_upsert_and_load() {
        let gateway = MemoryGateway::new();
        let row = row("ws");
        block_on(gateway.upsert_node("ws", &row)).unwrap();
        block_on(gateway.upsert_node("ws", &row)).unwrap();

        let rows = block_on(gateway.load_workspace("ws")).unwrap();
        assert_eq!(rows.nodes, vec![row]);
    }

    #[test]
    fn test_workspaces_are_isolated() {
        let gateway = MemoryGateway::new();
        block_on(gateway.upsert_node("a", &row("a"))).unwrap();
        assert!(block_on(gateway.load_workspace("a")).unwrap().connections.is_empty());
        assert!(matches!(block_on(gateway.load_workspace("b")), Err(PersistError::NotFound(_))));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let gateway = MemoryGateway::new();
        let row = row("ws");
        let id = row.id;
        block_on(gateway.apply("ws", &WriteOp::UpsertNode(row))).unwrap();
        block_on(gateway.apply("ws", &WriteOp::DeleteNode(id))).unwrap();
        block_on(gateway.apply("ws", &WriteOp::DeleteNode(id))).unwrap();
        assert!(block_on(gateway.load_workspace("ws")).unwrap().is_empty());
    }

    #[test]
    fn test_injected_failures() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(2);
        assert!(block_on(gateway.upsert_node("ws", &row("ws"))).is_err());
        assert!(block_on(gateway.upsert_node("ws", &row("ws"))).is_err());
        assert!(block_on(gateway.upsert_node("ws", &row("ws"))).is_ok());
        assert_eq!(gateway.write_count(), 3);
    }
}
