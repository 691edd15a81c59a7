//! Node entity.

use super::{Entity, FieldKey, NodeId, NodeKind, NodeStyle, UserId};
use kurbo::{Point, Rect, Size};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Smallest width or height a node may have.
pub const MIN_NODE_EXTENT: f64 = 1.0;

/// Largest magnitude of a world coordinate, and largest node extent.
pub const WORLD_LIMIT: f64 = 1.0e9;

/// Replace a non-finite coordinate with the origin and pull far-off ones
/// back inside the world.
pub fn clamp_coordinate(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-WORLD_LIMIT, WORLD_LIMIT)
    } else {
        0.0
    }
}

/// Replace a non-finite or too-small extent with the minimum. Extents are
/// capped at [`WORLD_LIMIT`].
pub fn clamp_extent(value: f64) -> f64 {
    if value.is_finite() && value >= MIN_NODE_EXTENT {
        value.min(WORLD_LIMIT)
    } else {
        MIN_NODE_EXTENT
    }
}

/// A positioned, sized item on the canvas.
///
/// `content` is opaque to the engine; it belongs to whatever text editor the
/// host plugs in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub position: Point,
    pub size: Size,
    pub kind: NodeKind,
    pub content: String,
    pub style: NodeStyle,
    pub z_index: i64,
    pub created_by: UserId,
    pub created_at: i64,
    pub updated_by: UserId,
    pub updated_at: i64,
    pub deleted: bool,
}

impl Node {
    /// Create a new node with a fresh id.
    pub fn new(position: Point, size: Size) -> Self {
        let mut node = Self::blank(Uuid::new_v4());
        node.position = Point::new(clamp_coordinate(position.x), clamp_coordinate(position.y));
        node.size = Size::new(clamp_extent(size.width), clamp_extent(size.height));
        node
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// World-space bounding box.
    pub fn bounds(&self) -> Rect {
        Rect::from_origin_size(self.position, self.size)
    }
}

/// One mergeable field of a [`Node`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeField {
    X(f64),
    Y(f64),
    Width(f64),
    Height(f64),
    Kind(NodeKind),
    Content(String),
    Style(NodeStyle),
    ZIndex(i64),
    CreatedBy(UserId),
    CreatedAt(i64),
    UpdatedBy(UserId),
    UpdatedAt(i64),
    Deleted(bool),
}

impl FieldKey for NodeField {
    fn key(&self) -> &'static str {
        match self {
            NodeField::X(_) => "x",
            NodeField::Y(_) => "y",
            NodeField::Width(_) => "w",
            NodeField::Height(_) => "h",
            NodeField::Kind(_) => "kind",
            NodeField::Content(_) => "content",
            NodeField::Style(_) => "style",
            NodeField::ZIndex(_) => "z_index",
            NodeField::CreatedBy(_) => "created_by",
            NodeField::CreatedAt(_) => "created_at",
            NodeField::UpdatedBy(_) => "updated_by",
            NodeField::UpdatedAt(_) => "updated_at",
            NodeField::Deleted(_) => crate::crdt::DELETED_FIELD,
        }
    }
}

impl Entity for Node {
    type Id = NodeId;
    type Field = NodeField;

    fn blank(id: NodeId) -> Self {
        Self {
            id,
            position: Point::ZERO,
            size: Size::new(MIN_NODE_EXTENT, MIN_NODE_EXTENT),
            kind: NodeKind::default(),
            content: String::new(),
            style: NodeStyle::default(),
            z_index: 0,
            created_by: String::new(),
            created_at: 0,
            updated_by: String::new(),
            updated_at: 0,
            deleted: false,
        }
    }

    fn id(&self) -> NodeId {
        self.id
    }

    fn apply(&mut self, field: NodeField) {
        match field {
            NodeField::X(x) => self.position.x = clamp_coordinate(x),
            NodeField::Y(y) => self.position.y = clamp_coordinate(y),
            NodeField::Width(w) => self.size.width = clamp_extent(w),
            NodeField::Height(h) => self.size.height = clamp_extent(h),
            NodeField::Kind(kind) => self.kind = kind,
            NodeField::Content(content) => self.content = content,
            NodeField::Style(style) => self.style = style,
            NodeField::ZIndex(z) => self.z_index = z,
            NodeField::CreatedBy(user) => self.created_by = user,
            NodeField::CreatedAt(t) => self.created_at = t,
            NodeField::UpdatedBy(user) => self.updated_by = user,
            NodeField::UpdatedAt(t) => self.updated_at = t,
            NodeField::Deleted(deleted) => self.deleted = deleted,
        }
    }

    fn fields(&self) -> Vec<NodeField> {
        vec![
            NodeField::X(self.position.x),
            NodeField::Y(self.position.y),
            NodeField::Width(self.size.width),
            NodeField::Height(self.size.height),
            NodeField::Kind(self.kind),
            NodeField::Content(self.content.clone()),
            NodeField::Style(self.style.clone()),
            NodeField::ZIndex(self.z_index),
            NodeField::CreatedBy(self.created_by.clone()),
            NodeField::CreatedAt(self.created_at),
            NodeField::UpdatedBy(self.updated_by.clone()),
            NodeField::UpdatedAt(self.updated_at),
            NodeField::Deleted(self.deleted),
        ]
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Partial update of a node. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub position: Option<Point>,
    pub size: Option<Size>,
    pub kind: Option<NodeKind>,
    pub content: Option<String>,
    pub style: Option<NodeStyle>,
    pub z_index: Option<i64>,
    pub updated_by: Option<UserId>,
    pub updated_at: Option<i64>,
}

impl NodePatch {
    pub fn position(position: Point) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn size(size: Size) -> Self {
        Self {
            size: Some(size),
            ..Default::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Only geometry position changes (audit fields aside).
    pub fn is_position_only(&self) -> bool {
        self.position.is_some()
            && self.size.is_none()
            && self.kind.is_none()
            && self.content.is_none()
            && self.style.is_none()
            && self.z_index.is_none()
    }

    pub fn is_size_only(&self) -> bool {
        self.size.is_some()
            && self.position.is_none()
            && self.kind.is_none()
            && self.content.is_none()
            && self.style.is_none()
            && self.z_index.is_none()
    }

    pub fn is_content_only(&self) -> bool {
        self.content.is_some()
            && self.position.is_none()
            && self.size.is_none()
            && self.kind.is_none()
            && self.style.is_none()
            && self.z_index.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    pub fn fields(&self) -> Vec<NodeField> {
        let mut fields = Vec::new();
        if let Some(p) = self.position {
            fields.push(NodeField::X(p.x));
            fields.push(NodeField::Y(p.y));
        }
        if let Some(s) = self.size {
            fields.push(NodeField::Width(s.width));
            fields.push(NodeField::Height(s.height));
        }
        if let Some(kind) = self.kind {
            fields.push(NodeField::Kind(kind));
        }
        if let Some(ref content) = self.content {
            fields.push(NodeField::Content(content.clone()));
        }
        if let Some(ref style) = self.style {
            fields.push(NodeField::Style(style.clone()));
        }
        if let Some(z) = self.z_index {
            fields.push(NodeField::ZIndex(z));
        }
        if let Some(ref user) = self.updated_by {
            fields.push(NodeField::UpdatedBy(user.clone()));
        }
        if let Some(t) = self.updated_at {
            fields.push(NodeField::UpdatedAt(t));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_geometry_is_clamped() {
        let node = Node::new(Point::new(f64::NAN, 5.0), Size::new(0.0, f64::INFINITY));
        assert_eq!(node.position, Point::new(0.0, 5.0));
        assert!((node.size.width - MIN_NODE_EXTENT).abs() < f64::EPSILON);
        assert!((node.size.height - MIN_NODE_EXTENT).abs() < f64::EPSILON);
    }

    #[test]
    fn test_huge_geometry_is_bounded() {
        let node = Node::new(Point::new(-5e21, 3e15), Size::new(1e22, 10.0));
        assert_eq!(node.position, Point::new(-WORLD_LIMIT, WORLD_LIMIT));
        assert_eq!(node.size, Size::new(WORLD_LIMIT, 10.0));

        let mut node = node;
        node.apply(NodeField::X(1e300));
        assert_eq!(node.position.x, WORLD_LIMIT);
    }

    #[test]
    fn test_apply_clamps_negative_width() {
        let mut node = Node::new(Point::ZERO, Size::new(10.0, 10.0));
        node.apply(NodeField::Width(-20.0));
        assert!((node.size.width - MIN_NODE_EXTENT).abs() < f64::EPSILON);
    }

    #[test]
    fn test_patch_classification() {
        assert!(NodePatch::position(Point::new(1.0, 2.0)).is_position_only());
        assert!(NodePatch::size(Size::new(1.0, 2.0)).is_size_only());
        assert!(!NodePatch::size(Size::new(1.0, 2.0)).is_position_only());

        let mut audited = NodePatch::content("hi");
        audited.updated_by = Some("u1".into());
        audited.updated_at = Some(10);
        assert!(audited.is_content_only());
    }

    #[test]
    fn test_patch_fields_split_axes() {
        let patch = NodePatch::position(Point::new(3.0, 4.0));
        assert_eq!(patch.fields(), vec![NodeField::X(3.0), NodeField::Y(4.0)]);
        assert!(NodePatch::default().is_empty());
    }
}
