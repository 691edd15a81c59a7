//! Frame building: the screen-space display list for the visible canvas.
//!
//! The engine does not rasterize. A host walks [`Frame`] and draws it with
//! whatever backend it has; everything here is already transformed to
//! screen coordinates and z-ordered.

use crate::camera::Camera;
use crate::controller::{CanvasController, ConnectionPreview};
use crate::model::{ConnectionId, Node, NodeId, NodeKind, RoutingType};
use crate::routing::{Endpoint, anchor_point, resolve_anchors, route, route_connection};
use crate::spatial::rects_overlap;
use crate::store::LocalStore;
use kurbo::{BezPath, Rect};
use peniko::Color;
use std::collections::{HashMap, HashSet};

/// Draw instructions for one node.
#[derive(Debug, Clone)]
pub struct NodeVisual {
    pub id: NodeId,
    pub kind: NodeKind,
    pub rect: Rect,
    pub corner_radius: f64,
    pub fill: Option<Color>,
    pub stroke: Option<Color>,
    pub stroke_width: f64,
    /// Text drawn inside the node, if the kind shows its content.
    pub label: Option<String>,
    pub selected: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionVisual {
    pub id: ConnectionId,
    pub path: BezPath,
    pub arrow: BezPath,
    pub stroke: Color,
    pub stroke_width: f64,
    pub dashed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub nodes: Vec<NodeVisual>,
    pub connections: Vec<ConnectionVisual>,
    /// Connection being drawn.
    pub preview: Option<BezPath>,
    pub marquee: Option<Rect>,
}

/// Turns a node and its screen rect into draw instructions.
pub type NodeRenderer = fn(&Node, Rect) -> NodeVisual;

fn base_visual(node: &Node, rect: Rect) -> NodeVisual {
    NodeVisual {
        id: node.id,
        kind: node.kind,
        rect,
        corner_radius: node.style.corner_radius,
        fill: node.style.fill_color.map(Color::from),
        stroke: Some(Color::from(node.style.stroke_color)),
        stroke_width: node.style.stroke_width,
        label: Some(node.content.clone()).filter(|c| !c.is_empty()),
        selected: false,
    }
}

fn render_card(node: &Node, rect: Rect) -> NodeVisual {
    base_visual(node, rect)
}

fn render_sticky(node: &Node, rect: Rect) -> NodeVisual {
    NodeVisual {
        fill: Some(Color::from_rgba8(255, 236, 140, 255)),
        stroke: None,
        corner_radius: 0.0,
        ..base_visual(node, rect)
    }
}

fn render_frame(node: &Node, rect: Rect) -> NodeVisual {
    NodeVisual {
        fill: None,
        ..base_visual(node, rect)
    }
}

fn render_label(node: &Node, rect: Rect) -> NodeVisual {
    NodeVisual {
        fill: None,
        stroke: None,
        ..base_visual(node, rect)
    }
}

/// Renderer per node kind.
#[derive(Debug, Clone)]
pub struct RendererTable {
    renderers: HashMap<NodeKind, NodeRenderer>,
}

impl Default for RendererTable {
    fn default() -> Self {
        let mut table = Self {
            renderers: HashMap::new(),
        };
        table.register(NodeKind::Card, render_card);
        table.register(NodeKind::Sticky, render_sticky);
        table.register(NodeKind::Frame, render_frame);
        table.register(NodeKind::Label, render_label);
        table
    }
}

impl RendererTable {
    /// Replace the renderer for a kind.
    pub fn register(&mut self, kind: NodeKind, renderer: NodeRenderer) {
        self.renderers.insert(kind, renderer);
    }

    pub fn render(&self, node: &Node, rect: Rect) -> NodeVisual {
        match self.renderers.get(&node.kind) {
            Some(renderer) => renderer(node, rect),
            None => {
                log::warn!("No renderer for {} nodes, drawing as card", node.kind.as_str());
                render_card(node, rect)
            }
        }
    }
}

/// Build the display list for the visible nodes and the connections that
/// touch them or cross the view.
pub fn build_frame(
    store: &LocalStore,
    camera: &Camera,
    visible: &[NodeId],
    table: &RendererTable,
    controller: &CanvasController,
    head_size: f64,
) -> Frame {
    let transform = camera.transform();

    let mut nodes: Vec<&Node> = visible.iter().filter_map(|id| store.node(*id)).collect();
    nodes.sort_by_key(|n| (n.z_index, n.id));
    let node_visuals = nodes
        .into_iter()
        .map(|node| {
            let rect = transform.transform_rect_bbox(node.bounds());
            let mut visual = table.render(node, rect);
            visual.selected = store.is_selected(node.id);
            visual.stroke_width *= camera.scale;
            visual
        })
        .collect();

    let view = camera.visible_world_rect(0.0);
    let visible_set: HashSet<NodeId> = visible.iter().copied().collect();
    let mut connections: Vec<_> = store
        .connections()
        .into_iter()
        .filter_map(|conn| {
            let routed = route_connection(store, conn, head_size)?;
            let shown = visible_set.contains(&conn.start_node)
                || visible_set.contains(&conn.end_node)
                || rects_overlap(routed.bounds(), view);
            shown.then_some((conn, routed))
        })
        .collect();
    connections.sort_by_key(|(c, _)| (c.z_index, c.id));
    let connection_visuals = connections
        .into_iter()
        .map(|(conn, routed)| ConnectionVisual {
            id: conn.id,
            path: transform * routed.path,
            arrow: transform * routed.arrow.to_path(),
            stroke: Color::from(conn.style.stroke_color),
            stroke_width: conn.style.stroke_width * camera.scale,
            dashed: conn.style.dashed,
        })
        .collect();

    Frame {
        nodes: node_visuals,
        connections: connection_visuals,
        preview: controller
            .preview()
            .and_then(|preview| preview_path(store, preview, head_size))
            .map(|path| transform * path),
        marquee: controller.marquee().map(|rect| transform.transform_rect_bbox(rect)),
    }
}

/// World-space path of a connection being drawn, from the source anchor to
/// the hovered target or the cursor.
fn preview_path(store: &LocalStore, preview: &ConnectionPreview, head_size: f64) -> Option<BezPath> {
    let from = store.node(preview.from)?.bounds();
    let target = preview
        .target
        .and_then(|(id, side)| store.node(id).map(|node| (node.bounds(), side)));
    let routed = match target {
        Some((to, side)) => {
            let (start, end) = resolve_anchors(from, preview.from_anchor, to, side);
            route(RoutingType::Straight, start, end, head_size)
        }
        None => {
            let start = Endpoint {
                point: anchor_point(from, preview.from_anchor),
                side: preview.from_anchor,
            };
            let end = Endpoint {
                point: preview.cursor,
                side: preview.from_anchor,
            };
            route(RoutingType::Straight, start, end, head_size)
        }
    };
    let mut path = routed.path;
    path.extend(routed.arrow.to_path().elements().iter().copied());
    Some(path)
}
