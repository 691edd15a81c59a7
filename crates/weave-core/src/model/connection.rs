//! Connections between nodes and the bindings that attach them.

use super::{AnchorSide, BindingId, ConnectionId, ConnectionStyle, Entity, FieldKey, NodeId, RoutingType, Terminal};
use kurbo::Vec2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A directed link from one node to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub start_node: NodeId,
    pub end_node: NodeId,
    pub start_anchor: AnchorSide,
    pub end_anchor: AnchorSide,
    pub routing: RoutingType,
    pub style: ConnectionStyle,
    pub z_index: i64,
    pub deleted: bool,
}

impl Connection {
    pub fn new(start_node: NodeId, start_anchor: AnchorSide, end_node: NodeId, end_anchor: AnchorSide) -> Self {
        Self {
            start_node,
            end_node,
            start_anchor,
            end_anchor,
            ..Self::blank(Uuid::new_v4())
        }
    }

    pub fn with_routing(mut self, routing: RoutingType) -> Self {
        self.routing = routing;
        self
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.start_node == node || self.end_node == node
    }

    /// Bindings for both ends, carrying the declared anchors.
    pub fn default_bindings(&self) -> [Binding; 2] {
        [
            Binding::new(self.id, self.start_node, Terminal::Start, self.start_anchor),
            Binding::new(self.id, self.end_node, Terminal::End, self.end_anchor),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionField {
    StartNode(NodeId),
    EndNode(NodeId),
    StartAnchor(AnchorSide),
    EndAnchor(AnchorSide),
    Routing(RoutingType),
    Style(ConnectionStyle),
    ZIndex(i64),
    Deleted(bool),
}

impl FieldKey for ConnectionField {
    fn key(&self) -> &'static str {
        match self {
            ConnectionField::StartNode(_) => "start_node_id",
            ConnectionField::EndNode(_) => "end_node_id",
            ConnectionField::StartAnchor(_) => "start_anchor",
            ConnectionField::EndAnchor(_) => "end_anchor",
            ConnectionField::Routing(_) => "type",
            ConnectionField::Style(_) => "style",
            ConnectionField::ZIndex(_) => "z_index",
            ConnectionField::Deleted(_) => crate::crdt::DELETED_FIELD,
        }
    }
}

impl Entity for Connection {
    type Id = ConnectionId;
    type Field = ConnectionField;

    fn blank(id: ConnectionId) -> Self {
        Self {
            id,
            start_node: Uuid::nil(),
            end_node: Uuid::nil(),
            start_anchor: AnchorSide::Center,
            end_anchor: AnchorSide::Center,
            routing: RoutingType::default(),
            style: ConnectionStyle::default(),
            z_index: 0,
            deleted: false,
        }
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn apply(&mut self, field: ConnectionField) {
        match field {
            ConnectionField::StartNode(id) => self.start_node = id,
            ConnectionField::EndNode(id) => self.end_node = id,
            ConnectionField::StartAnchor(side) => self.start_anchor = side,
            ConnectionField::EndAnchor(side) => self.end_anchor = side,
            ConnectionField::Routing(routing) => self.routing = routing,
            ConnectionField::Style(style) => self.style = style,
            ConnectionField::ZIndex(z) => self.z_index = z,
            ConnectionField::Deleted(deleted) => self.deleted = deleted,
        }
    }

    fn fields(&self) -> Vec<ConnectionField> {
        vec![
            ConnectionField::StartNode(self.start_node),
            ConnectionField::EndNode(self.end_node),
            ConnectionField::StartAnchor(self.start_anchor),
            ConnectionField::EndAnchor(self.end_anchor),
            ConnectionField::Routing(self.routing),
            ConnectionField::Style(self.style.clone()),
            ConnectionField::ZIndex(self.z_index),
            ConnectionField::Deleted(self.deleted),
        ]
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Partial update of a connection. Endpoints are fixed at creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionPatch {
    pub start_anchor: Option<AnchorSide>,
    pub end_anchor: Option<AnchorSide>,
    pub routing: Option<RoutingType>,
    pub style: Option<ConnectionStyle>,
    pub z_index: Option<i64>,
}

impl ConnectionPatch {
    pub fn fields(&self) -> Vec<ConnectionField> {
        let mut fields = Vec::new();
        if let Some(side) = self.start_anchor {
            fields.push(ConnectionField::StartAnchor(side));
        }
        if let Some(side) = self.end_anchor {
            fields.push(ConnectionField::EndAnchor(side));
        }
        if let Some(routing) = self.routing {
            fields.push(ConnectionField::Routing(routing));
        }
        if let Some(ref style) = self.style {
            fields.push(ConnectionField::Style(style.clone()));
        }
        if let Some(z) = self.z_index {
            fields.push(ConnectionField::ZIndex(z));
        }
        fields
    }
}

/// How one end of a connection attaches to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub id: BindingId,
    pub connection: ConnectionId,
    pub node: NodeId,
    pub terminal: Terminal,
    pub anchor: AnchorSide,
    /// Shift from the anchor point, in world units.
    pub offset: Vec2,
    pub deleted: bool,
}

impl Binding {
    pub fn new(connection: ConnectionId, node: NodeId, terminal: Terminal, anchor: AnchorSide) -> Self {
        Self {
            connection,
            node,
            terminal,
            anchor,
            ..Self::blank(Uuid::new_v4())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingField {
    Connection(ConnectionId),
    Node(NodeId),
    Terminal(Terminal),
    Anchor(AnchorSide),
    OffsetX(f64),
    OffsetY(f64),
    Deleted(bool),
}

impl FieldKey for BindingField {
    fn key(&self) -> &'static str {
        match self {
            BindingField::Connection(_) => "connection_id",
            BindingField::Node(_) => "node_id",
            BindingField::Terminal(_) => "terminal",
            BindingField::Anchor(_) => "anchor_side",
            BindingField::OffsetX(_) => "offset_x",
            BindingField::OffsetY(_) => "offset_y",
            BindingField::Deleted(_) => crate::crdt::DELETED_FIELD,
        }
    }
}

impl Entity for Binding {
    type Id = BindingId;
    type Field = BindingField;

    fn blank(id: BindingId) -> Self {
        Self {
            id,
            connection: Uuid::nil(),
            node: Uuid::nil(),
            terminal: Terminal::Start,
            anchor: AnchorSide::Center,
            offset: Vec2::ZERO,
            deleted: false,
        }
    }

    fn id(&self) -> BindingId {
        self.id
    }

    fn apply(&mut self, field: BindingField) {
        match field {
            BindingField::Connection(id) => self.connection = id,
            BindingField::Node(id) => self.node = id,
            BindingField::Terminal(terminal) => self.terminal = terminal,
            BindingField::Anchor(side) => self.anchor = side,
            BindingField::OffsetX(x) => self.offset.x = super::clamp_coordinate(x),
            BindingField::OffsetY(y) => self.offset.y = super::clamp_coordinate(y),
            BindingField::Deleted(deleted) => self.deleted = deleted,
        }
    }

    fn fields(&self) -> Vec<BindingField> {
        vec![
            BindingField::Connection(self.connection),
            BindingField::Node(self.node),
            BindingField::Terminal(self.terminal),
            BindingField::Anchor(self.anchor),
            BindingField::OffsetX(self.offset.x),
            BindingField::OffsetY(self.offset.y),
            BindingField::Deleted(self.deleted),
        ]
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}
