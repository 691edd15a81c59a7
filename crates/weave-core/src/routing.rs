//! Connection anchoring and path routing.

use crate::model::{AnchorSide, BindingId, Connection, ConnectionId, NodeId, RoutingType, Terminal};
use crate::store::{LocalStore, StoreError};
use kurbo::{BezPath, Point, Rect, Shape, Vec2};
use std::collections::BTreeSet;

/// Distance the elbow router keeps from a node before turning.
const ELBOW_MARGIN: f64 = 20.0;
/// Minimum control-arm length of a curved connection.
const MIN_CURVE_ARM: f64 = 30.0;

/// Point on a node's bounds for an anchor side.
pub fn anchor_point(rect: Rect, side: AnchorSide) -> Point {
    let center = rect.center();
    match side {
        AnchorSide::Top => Point::new(center.x, rect.y0),
        AnchorSide::Right => Point::new(rect.x1, center.y),
        AnchorSide::Bottom => Point::new(center.x, rect.y1),
        AnchorSide::Left => Point::new(rect.x0, center.y),
        AnchorSide::Center => center,
    }
}

/// The side anchor of `rect` nearest to `toward`. Ties go to the side
/// listed first in [`AnchorSide::SIDES`].
pub fn resolve_side(rect: Rect, toward: Point) -> AnchorSide {
    let mut best = AnchorSide::SIDES[0];
    let mut best_dist = f64::INFINITY;
    for side in AnchorSide::SIDES {
        let dist = anchor_point(rect, side).distance(toward);
        if dist < best_dist {
            best = side;
            best_dist = dist;
        }
    }
    best
}

/// A resolved connection end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Endpoint {
    pub point: Point,
    /// Never `Center` once resolved.
    pub side: AnchorSide,
}

/// Resolve both ends of a connection. A `Center` anchor picks, on every
/// call, the side nearest the other end.
pub fn resolve_anchors(
    start_rect: Rect,
    start_side: AnchorSide,
    end_rect: Rect,
    end_side: AnchorSide,
) -> (Endpoint, Endpoint) {
    let resolve = |rect: Rect, side: AnchorSide, other_rect: Rect, other_side: AnchorSide| {
        let side = match side {
            AnchorSide::Center => resolve_side(rect, anchor_point(other_rect, other_side)),
            side => side,
        };
        Endpoint {
            point: anchor_point(rect, side),
            side,
        }
    };
    (
        resolve(start_rect, start_side, end_rect, end_side),
        resolve(end_rect, end_side, start_rect, start_side),
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrowHead {
    pub tip: Point,
    pub left: Point,
    pub right: Point,
}

impl ArrowHead {
    /// Arrow head at `tip` pointing along `direction`.
    fn new(tip: Point, direction: Vec2, size: f64) -> Self {
        let len = direction.hypot();
        let dir = if len > f64::EPSILON {
            direction / len
        } else {
            Vec2::new(1.0, 0.0)
        };
        let perp = Vec2::new(-dir.y, dir.x);
        let back = tip - dir * size;
        Self {
            tip,
            left: back + perp * size * 0.5,
            right: back - perp * size * 0.5,
        }
    }

    pub fn to_path(&self) -> BezPath {
        let mut path = BezPath::new();
        path.move_to(self.tip);
        path.line_to(self.left);
        path.move_to(self.tip);
        path.line_to(self.right);
        path
    }
}

/// Geometry of one connection, in world coordinates.
#[derive(Debug, Clone)]
pub struct RoutedPath {
    pub start: Endpoint,
    pub end: Endpoint,
    /// Polyline vertices, or the cubic's four control points when curved.
    pub points: Vec<Point>,
    pub path: BezPath,
    pub arrow: ArrowHead,
}

impl RoutedPath {
    pub fn bounds(&self) -> Rect {
        let shaft = self.path.bounding_box();
        [self.arrow.left, self.arrow.right]
            .into_iter()
            .fold(shaft, |rect, p| rect.union_pt(p))
    }
}

/// Route a connection between two resolved endpoints.
pub fn route(routing: RoutingType, start: Endpoint, end: Endpoint, head_size: f64) -> RoutedPath {
    let (s, e) = (start.point, end.point);
    let mut path = BezPath::new();
    path.move_to(s);

    let points = match routing {
        RoutingType::Straight => {
            path.line_to(e);
            vec![s, e]
        }
        RoutingType::Curved => {
            let arm = (s.distance(e) * 0.4).max(MIN_CURVE_ARM);
            let c1 = s + start.side.normal() * arm;
            let c2 = e + end.side.normal() * arm;
            path.curve_to(c1, c2, e);
            vec![s, c1, c2, e]
        }
        RoutingType::Elbow => {
            let points = compute_elbow_path(start, end);
            for p in &points[1..] {
                path.line_to(*p);
            }
            points
        }
    };

    // Direction of the last segment, falling back to the overall direction.
    let n = points.len();
    let direction = match points[n - 1] - points[n - 2] {
        d if d.hypot() > f64::EPSILON => d,
        _ => e - s,
    };
    RoutedPath {
        start,
        end,
        arrow: ArrowHead::new(e, direction, head_size),
        points,
        path,
    }
}

/// Orthogonal polyline from `start` to `end`: leave each node along its
/// anchor normal, then meet on a midline.
fn compute_elbow_path(start: Endpoint, end: Endpoint) -> Vec<Point> {
    let p1 = start.point + start.side.normal() * ELBOW_MARGIN;
    let p2 = end.point + end.side.normal() * ELBOW_MARGIN;

    let mut points = vec![start.point, p1];
    if start.side.is_horizontal() {
        let mid_x = (p1.x + p2.x) / 2.0;
        points.push(Point::new(mid_x, p1.y));
        points.push(Point::new(mid_x, p2.y));
    } else {
        let mid_y = (p1.y + p2.y) / 2.0;
        points.push(Point::new(p1.x, mid_y));
        points.push(Point::new(p2.x, mid_y));
    }
    points.push(p2);
    points.push(end.point);
    points.dedup_by(|a, b| a.distance(*b) < f64::EPSILON);
    if points.len() < 2 {
        points.push(end.point);
    }
    points
}

/// Anchor and offset for one end, taking the binding over the connection's
/// own anchor when one is attached to the same node.
fn terminal_anchor(store: &LocalStore, conn: &Connection, terminal: Terminal) -> (AnchorSide, Vec2) {
    let (node, anchor) = match terminal {
        Terminal::Start => (conn.start_node, conn.start_anchor),
        Terminal::End => (conn.end_node, conn.end_anchor),
    };
    match store.binding_for(conn.id, terminal) {
        Some(binding) if binding.node == node => (binding.anchor, binding.offset),
        Some(binding) => {
            log::debug!(
                "Binding {} targets node {} but connection {} ends at {}",
                binding.id,
                binding.node,
                conn.id,
                node
            );
            (anchor, Vec2::ZERO)
        }
        None => (anchor, Vec2::ZERO),
    }
}

/// Route a stored connection. `None` if it is not live.
pub fn route_connection(store: &LocalStore, conn: &Connection, head_size: f64) -> Option<RoutedPath> {
    let start_rect = store.node(conn.start_node)?.bounds();
    let end_rect = store.node(conn.end_node)?.bounds();
    if conn.deleted {
        return None;
    }
    let (start_anchor, start_offset) = terminal_anchor(store, conn, Terminal::Start);
    let (end_anchor, end_offset) = terminal_anchor(store, conn, Terminal::End);

    let (mut start, mut end) = resolve_anchors(start_rect, start_anchor, end_rect, end_anchor);
    start.point += start_offset;
    end.point += end_offset;
    Some(route(conn.routing, start, end, head_size))
}

/// Everything that must be tombstoned along with a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeSet {
    pub connections: Vec<ConnectionId>,
    pub bindings: Vec<BindingId>,
}

impl CascadeSet {
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty() && self.bindings.is_empty()
    }
}

/// Connections touching `node` and every binding of those connections or
/// of the node itself.
pub fn cascade_targets(store: &LocalStore, node: NodeId) -> CascadeSet {
    let connections: BTreeSet<ConnectionId> = store
        .connections_for_node(node)
        .into_iter()
        .map(|c| c.id)
        .collect();
    let mut bindings: BTreeSet<BindingId> = store.bindings_for_node(node).into_iter().map(|b| b.id).collect();
    for conn in &connections {
        bindings.extend(store.bindings_for_connection(*conn).into_iter().map(|b| b.id));
    }
    CascadeSet {
        connections: connections.into_iter().collect(),
        bindings: bindings.into_iter().collect(),
    }
}

/// Both endpoints must be distinct, live nodes.
pub fn validate_endpoints(store: &LocalStore, start: NodeId, end: NodeId) -> Result<(), StoreError> {
    store.validate_endpoints(start, end)
}

/// The anchor of `rect` within `tolerance` of `point`, nearest first.
pub fn hit_anchor(rect: Rect, point: Point, tolerance: f64) -> Option<AnchorSide> {
    AnchorSide::SIDES
        .into_iter()
        .chain(std::iter::once(AnchorSide::Center))
        .map(|side| (side, anchor_point(rect, side).distance(point)))
        .filter(|(_, dist)| *dist <= tolerance)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(side, _)| side)
}
