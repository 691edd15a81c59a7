//! Canvas entities: nodes, connections, bindings and per-user viewports.
//!
//! Every entity is a flat bag of independently mergeable fields. The
//! [`Entity`] trait exposes that shape so the store and the document bridge
//! can merge one field at a time instead of whole objects.

mod connection;
mod node;
mod viewport;

pub use connection::{Binding, BindingField, Connection, ConnectionField, ConnectionPatch};
pub use node::{MIN_NODE_EXTENT, Node, NodeField, NodePatch, WORLD_LIMIT, clamp_coordinate, clamp_extent};
pub use viewport::{ViewportField, ViewportState};

use crate::crdt::Stamp;
use peniko::Color;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use uuid::Uuid;

pub type NodeId = Uuid;
pub type ConnectionId = Uuid;
pub type BindingId = Uuid;
pub type UserId = String;

/// Where on a node's boundary a connection attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorSide {
    Top,
    Right,
    Bottom,
    Left,
    /// Resolved to the side nearest the other endpoint at render time.
    #[default]
    Center,
}

impl AnchorSide {
    /// The four concrete sides, in resolution tie-break order.
    pub const SIDES: [AnchorSide; 4] = [AnchorSide::Top, AnchorSide::Right, AnchorSide::Bottom, AnchorSide::Left];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorSide::Top => "top",
            AnchorSide::Right => "right",
            AnchorSide::Bottom => "bottom",
            AnchorSide::Left => "left",
            AnchorSide::Center => "center",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "top" => Some(AnchorSide::Top),
            "right" => Some(AnchorSide::Right),
            "bottom" => Some(AnchorSide::Bottom),
            "left" => Some(AnchorSide::Left),
            "center" => Some(AnchorSide::Center),
            _ => None,
        }
    }

    /// Outward unit normal of the side. Zero for center.
    pub fn normal(&self) -> kurbo::Vec2 {
        match self {
            AnchorSide::Top => kurbo::Vec2::new(0.0, -1.0),
            AnchorSide::Right => kurbo::Vec2::new(1.0, 0.0),
            AnchorSide::Bottom => kurbo::Vec2::new(0.0, 1.0),
            AnchorSide::Left => kurbo::Vec2::new(-1.0, 0.0),
            AnchorSide::Center => kurbo::Vec2::ZERO,
        }
    }

    pub fn is_horizontal(&self) -> bool {
        matches!(self, AnchorSide::Left | AnchorSide::Right)
    }
}

/// Path shape of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingType {
    #[default]
    Straight,
    Curved,
    Elbow,
}

impl RoutingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingType::Straight => "straight",
            RoutingType::Curved => "curved",
            RoutingType::Elbow => "elbow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "straight" => Some(RoutingType::Straight),
            "curved" => Some(RoutingType::Curved),
            "elbow" => Some(RoutingType::Elbow),
            _ => None,
        }
    }
}

/// Which end of a connection a binding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminal {
    Start,
    End,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::Start => "start",
            Terminal::End => "end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Terminal::Start),
            "end" => Some(Terminal::End),
            _ => None,
        }
    }
}

/// Content kind of a node. Selects the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Card,
    Sticky,
    Frame,
    Label,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Card => "card",
            NodeKind::Sticky => "sticky",
            NodeKind::Frame => "frame",
            NodeKind::Label => "label",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "card" => Some(NodeKind::Card),
            "sticky" => Some(NodeKind::Sticky),
            "frame" => Some(NodeKind::Frame),
            "label" => Some(NodeKind::Label),
            _ => None,
        }
    }
}

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }
}

impl From<Color> for SerializableColor {
    fn from(color: Color) -> Self {
        let rgba = color.to_rgba8();
        Self {
            r: rgba.r,
            g: rgba.g,
            b: rgba.b,
            a: rgba.a,
        }
    }
}

impl From<SerializableColor> for Color {
    fn from(color: SerializableColor) -> Self {
        Color::from_rgba8(color.r, color.g, color.b, color.a)
    }
}

/// Visual style of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStyle {
    pub stroke_color: SerializableColor,
    pub fill_color: Option<SerializableColor>,
    pub stroke_width: f64,
    pub corner_radius: f64,
}

impl Default for NodeStyle {
    fn default() -> Self {
        Self {
            stroke_color: SerializableColor::new(30, 30, 30, 255),
            fill_color: Some(SerializableColor::white()),
            stroke_width: 1.5,
            corner_radius: 6.0,
        }
    }
}

/// Visual style of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStyle {
    pub stroke_color: SerializableColor,
    pub stroke_width: f64,
    pub dashed: bool,
}

impl Default for ConnectionStyle {
    fn default() -> Self {
        Self {
            stroke_color: SerializableColor::new(30, 30, 30, 255),
            stroke_width: 2.0,
            dashed: false,
        }
    }
}

/// A single named field of an entity.
pub trait FieldKey {
    fn key(&self) -> &'static str;
}

/// An entity made of independently mergeable fields.
pub trait Entity: Clone {
    type Id: Clone + Eq + Hash;
    type Field: FieldKey;

    /// An empty entity that only knows its id, used when the first field
    /// seen for an id is not its creation record.
    fn blank(id: Self::Id) -> Self;

    fn id(&self) -> Self::Id;

    fn apply(&mut self, field: Self::Field);

    /// Every field of the entity, for stamping a whole record at once.
    fn fields(&self) -> Vec<Self::Field>;

    fn is_deleted(&self) -> bool;
}

/// An entity plus the stamp of the last write applied to each field.
#[derive(Debug, Clone)]
pub struct Tracked<E: Entity> {
    entity: E,
    stamps: HashMap<&'static str, Stamp>,
}

impl<E: Entity> Tracked<E> {
    pub fn blank(id: E::Id) -> Self {
        Self {
            entity: E::blank(id),
            stamps: HashMap::new(),
        }
    }

    /// Merge a single field. Applied only when `stamp` is newer than the
    /// stamp of the field's current value. Returns true if it was applied.
    pub fn merge(&mut self, field: E::Field, stamp: Stamp) -> bool {
        let key = field.key();
        if let Some(existing) = self.stamps.get(key) {
            if *existing >= stamp {
                return false;
            }
        }
        self.entity.apply(field);
        self.stamps.insert(key, stamp);
        true
    }

    /// Merge every field of `record` with one stamp.
    pub fn merge_all(&mut self, record: &E, stamp: Stamp) -> bool {
        let mut changed = false;
        for field in record.fields() {
            changed |= self.merge(field, stamp);
        }
        changed
    }

    pub fn get(&self) -> &E {
        &self.entity
    }

    pub fn stamp_of(&self, key: &str) -> Option<Stamp> {
        self.stamps.get(key).copied()
    }

    pub fn is_deleted(&self) -> bool {
        self.entity.is_deleted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurbo::{Point, Size};

    fn stamp(time: i64) -> Stamp {
        Stamp { time, counter: 0, peer: 1 }
    }

    #[test]
    fn test_anchor_side_parse_roundtrip() {
        for side in [AnchorSide::Top, AnchorSide::Right, AnchorSide::Bottom, AnchorSide::Left, AnchorSide::Center] {
            assert_eq!(AnchorSide::parse(side.as_str()), Some(side));
        }
        assert_eq!(AnchorSide::parse("diagonal"), None);
    }

    #[test]
    fn test_tracked_older_write_is_ignored() {
        let node = Node::new(Point::new(0.0, 0.0), Size::new(10.0, 10.0));
        let mut tracked = Tracked::blank(node.id);
        assert!(tracked.merge_all(&node, stamp(5)));

        assert!(tracked.merge(NodeField::Content("new".into()), stamp(10)));
        assert!(!tracked.merge(NodeField::Content("old".into()), stamp(7)));
        assert_eq!(tracked.get().content, "new");
    }

    #[test]
    fn test_tracked_same_stamp_is_idempotent() {
        let node = Node::new(Point::new(0.0, 0.0), Size::new(10.0, 10.0));
        let mut tracked = Tracked::blank(node.id);
        assert!(tracked.merge_all(&node, stamp(5)));
        assert!(!tracked.merge_all(&node, stamp(5)));
    }

    #[test]
    fn test_fields_merge_independently() {
        let node = Node::new(Point::new(0.0, 0.0), Size::new(10.0, 10.0));
        let mut tracked = Tracked::blank(node.id);
        tracked.merge_all(&node, stamp(1));

        // Concurrent resizes on different axes both survive.
        tracked.merge(NodeField::Width(50.0), stamp(3));
        tracked.merge(NodeField::Height(80.0), stamp(2));
        assert!((tracked.get().size.width - 50.0).abs() < f64::EPSILON);
        assert!((tracked.get().size.height - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_color_conversion() {
        let color = SerializableColor::new(10, 20, 30, 255);
        let peniko_color: Color = color.into();
        assert_eq!(SerializableColor::from(peniko_color), color);
    }
}
