//! Local mutation vocabulary.

use crate::crdt::{EntityKey, FieldValues, Stamp, fields_to_values};
use crate::model::{
    Binding, BindingId, Connection, ConnectionId, ConnectionPatch, Entity, Node, NodeId, NodePatch, ViewportState,
};
use crate::store::{LocalStore, StoreError};

/// A write to the shared document produced by a local action.
#[derive(Debug, Clone, PartialEq)]
pub enum DocWrite {
    Put(EntityKey, FieldValues),
    Delete(EntityKey),
}

/// A mutation initiated on this client.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalAction {
    AddNode(Node),
    UpdateNode { id: NodeId, patch: NodePatch },
    DeleteNode(NodeId),
    AddConnection(Connection),
    UpdateConnection { id: ConnectionId, patch: ConnectionPatch },
    DeleteConnection(ConnectionId),
    AddBinding(Binding),
    DeleteBinding(BindingId),
    SetViewport(ViewportState),
}

impl LocalAction {
    pub fn name(&self) -> &'static str {
        match self {
            LocalAction::AddNode(_) => "add_node",
            LocalAction::UpdateNode { .. } => "update_node",
            LocalAction::DeleteNode(_) => "delete_node",
            LocalAction::AddConnection(_) => "add_connection",
            LocalAction::UpdateConnection { .. } => "update_connection",
            LocalAction::DeleteConnection(_) => "delete_connection",
            LocalAction::AddBinding(_) => "add_binding",
            LocalAction::DeleteBinding(_) => "delete_binding",
            LocalAction::SetViewport(_) => "set_viewport",
        }
    }

    /// Document address of the entity this action writes.
    pub fn target(&self) -> EntityKey {
        match self {
            LocalAction::AddNode(node) => EntityKey::node(node.id),
            LocalAction::UpdateNode { id, .. } | LocalAction::DeleteNode(id) => EntityKey::node(id),
            LocalAction::AddConnection(conn) => EntityKey::connection(conn.id),
            LocalAction::UpdateConnection { id, .. } | LocalAction::DeleteConnection(id) => {
                EntityKey::connection(id)
            }
            LocalAction::AddBinding(binding) => EntityKey::binding(binding.id),
            LocalAction::DeleteBinding(id) => EntityKey::binding(id),
            LocalAction::SetViewport(vp) => EntityKey::viewport(&vp.owner),
        }
    }

    /// Fill in who changed the entity and when.
    pub fn stamp_audit(&mut self, user: &str, now: i64) {
        match self {
            LocalAction::AddNode(node) => {
                if node.created_by.is_empty() {
                    node.created_by = user.to_string();
                }
                if node.created_at == 0 {
                    node.created_at = now;
                }
                node.updated_by = user.to_string();
                node.updated_at = now;
            }
            LocalAction::UpdateNode { patch, .. } => {
                patch.updated_by = Some(user.to_string());
                patch.updated_at = Some(now);
            }
            LocalAction::SetViewport(vp) => vp.updated_at = now,
            _ => {}
        }
    }

    /// Apply optimistically to the local store.
    pub fn apply_to_store(&self, store: &mut LocalStore, stamp: Stamp) -> Result<bool, StoreError> {
        match self {
            LocalAction::AddNode(node) => Ok(store.add_node(node.clone(), stamp)),
            LocalAction::UpdateNode { id, patch } => store.update_node(*id, patch, stamp),
            LocalAction::DeleteNode(id) => Ok(store.delete_node(*id, stamp)),
            LocalAction::AddConnection(conn) => store.add_connection(conn.clone(), stamp),
            LocalAction::UpdateConnection { id, patch } => store.update_connection(*id, patch, stamp),
            LocalAction::DeleteConnection(id) => Ok(store.delete_connection(*id, stamp)),
            LocalAction::AddBinding(binding) => store.add_binding(binding.clone(), stamp),
            LocalAction::DeleteBinding(id) => Ok(store.delete_binding(*id, stamp)),
            LocalAction::SetViewport(vp) => Ok(store.set_viewport(vp.clone(), stamp)),
        }
    }

    /// Serialize into document writes. Empty for a patch with no fields.
    pub fn doc_writes(&self) -> Vec<DocWrite> {
        let key = self.target();
        let values = match self {
            LocalAction::AddNode(node) => fields_to_values(&node.fields()),
            LocalAction::UpdateNode { patch, .. } => fields_to_values(&patch.fields()),
            LocalAction::AddConnection(conn) => fields_to_values(&conn.fields()),
            LocalAction::UpdateConnection { patch, .. } => fields_to_values(&patch.fields()),
            LocalAction::AddBinding(binding) => fields_to_values(&binding.fields()),
            LocalAction::SetViewport(vp) => fields_to_values(&vp.fields()),
            LocalAction::DeleteNode(_) | LocalAction::DeleteConnection(_) | LocalAction::DeleteBinding(_) => {
                return vec![DocWrite::Delete(key)];
            }
        };
        if values.is_empty() {
            Vec::new()
        } else {
            vec![DocWrite::Put(key, values)]
        }
    }
}
