//! Canvas interaction state machine.
//!
//! The controller turns pointer and key events into [`Effect`]s. It never
//! mutates the store itself; the engine applies the effects. Every state
//! limits which mutations it may emit, see [`ControllerState::permits`].

use crate::actions::LocalAction;
use crate::camera::{Camera, ZoomAnchor};
use crate::config::EngineConfig;
use crate::input::{InputState, KeyEvent, Modifiers, MouseButton, PointerEvent};
use crate::model::{AnchorSide, Connection, MIN_NODE_EXTENT, Node, NodeId, NodePatch};
use crate::routing::hit_anchor;
use crate::spatial::SpatialIndex;
use crate::store::LocalStore;
use kurbo::{Point, Rect, Size, Vec2};

/// Read-only view of the engine the controller decides against.
pub struct ControllerContext<'a> {
    pub store: &'a LocalStore,
    pub camera: &'a Camera,
    pub index: &'a SpatialIndex,
    pub config: &'a EngineConfig,
}

impl ControllerContext<'_> {
    fn to_world(&self, screen: Point) -> Point {
        self.camera.screen_to_world(screen)
    }

    /// Screen-pixel tolerance in world units.
    fn world_tolerance(&self, pixels: f64) -> f64 {
        pixels / self.camera.scale
    }

    /// Topmost live node under a world point.
    fn node_at(&self, world: Point, exclude: Option<NodeId>) -> Option<&Node> {
        let tol = self.world_tolerance(self.config.anchor_tolerance);
        let probe = Rect::from_center_size(world, Size::new(tol * 2.0, tol * 2.0));
        self.index
            .query(probe)
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .filter_map(|id| self.store.node(id))
            .filter(|node| node.bounds().inflate(tol, tol).contains(world))
            .max_by_key(|node| (node.z_index, node.id))
    }
}

/// Ephemeral state of a connection being drawn. Never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionPreview {
    pub from: NodeId,
    pub from_anchor: AnchorSide,
    /// Cursor in world coordinates.
    pub cursor: Point,
    /// Node and anchor the connection would attach to if released here.
    pub target: Option<(NodeId, AnchorSide)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerState {
    Idle,
    /// Marquee selection, world coordinates.
    Selecting {
        origin: Point,
        current: Point,
        additive: bool,
    },
    Dragging {
        grab: Point,
        origins: Vec<(NodeId, Point)>,
    },
    Resizing {
        id: NodeId,
        grab: Point,
        origin: Rect,
    },
    ConnectionDrawing(ConnectionPreview),
    Editing {
        id: NodeId,
    },
}

impl ControllerState {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Selecting { .. } => "selecting",
            ControllerState::Dragging { .. } => "dragging",
            ControllerState::Resizing { .. } => "resizing",
            ControllerState::ConnectionDrawing(_) => "connection_drawing",
            ControllerState::Editing { .. } => "editing",
        }
    }

    /// Whether this state may emit `action`.
    pub fn permits(&self, action: &LocalAction) -> bool {
        match (self, action) {
            (ControllerState::Idle, LocalAction::DeleteNode(_)) => true,
            (ControllerState::Dragging { origins, .. }, LocalAction::UpdateNode { id, patch }) => {
                patch.is_position_only() && origins.iter().any(|(origin, _)| origin == id)
            }
            (ControllerState::Resizing { id: target, .. }, LocalAction::UpdateNode { id, patch }) => {
                patch.is_size_only() && target == id
            }
            (ControllerState::ConnectionDrawing(_), LocalAction::AddConnection(_) | LocalAction::AddBinding(_)) => true,
            (ControllerState::Editing { id: target, .. }, LocalAction::UpdateNode { id, patch }) => {
                patch.is_content_only() && target == id
            }
            _ => false,
        }
    }

    fn is_gesture(&self) -> bool {
        matches!(
            self,
            ControllerState::Selecting { .. }
                | ControllerState::Dragging { .. }
                | ControllerState::Resizing { .. }
                | ControllerState::ConnectionDrawing(_)
        )
    }
}

/// Something the engine should do in response to input.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Mutate(LocalAction),
    Select { ids: Vec<NodeId>, additive: bool },
    ClearSelection,
    BeginTextEdit { id: NodeId, content: String },
    EndTextEdit { id: NodeId },
    /// Screen-space pan.
    Pan(Vec2),
    Zoom { factor: f64, anchor: ZoomAnchor },
    RenderNeeded,
}

#[derive(Debug, Clone)]
pub struct CanvasController {
    state: ControllerState,
    input: InputState,
    /// Last screen position of a middle-button pan.
    pan_anchor: Option<Point>,
}

impl Default for CanvasController {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasController {
    pub fn new() -> Self {
        Self {
            state: ControllerState::Idle,
            input: InputState::new(),
            pan_anchor: None,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn input(&self) -> &InputState {
        &self.input
    }

    pub fn set_modifiers(&mut self, modifiers: Modifiers) {
        self.input.set_modifiers(modifiers);
    }

    pub fn preview(&self) -> Option<&ConnectionPreview> {
        match &self.state {
            ControllerState::ConnectionDrawing(preview) => Some(preview),
            _ => None,
        }
    }

    /// Marquee rectangle in world coordinates while selecting.
    pub fn marquee(&self) -> Option<Rect> {
        match self.state {
            ControllerState::Selecting { origin, current, .. } => Some(Rect::from_points(origin, current)),
            _ => None,
        }
    }

    /// Queue a mutation if the current state allows it.
    fn push_mutation(&self, effects: &mut Vec<Effect>, action: LocalAction) {
        if self.state.permits(&action) {
            effects.push(Effect::Mutate(action));
        } else {
            debug_assert!(
                false,
                "{} is not permitted while {}",
                action.name(),
                self.state.name()
            );
            log::error!("Dropping {} emitted while {}", action.name(), self.state.name());
        }
    }

    pub fn handle_pointer(&mut self, event: &PointerEvent, ctx: &ControllerContext) -> Vec<Effect> {
        self.input.handle_pointer_event(event);
        match *event {
            PointerEvent::Down { position, button } => match button {
                MouseButton::Middle => {
                    self.pan_anchor = Some(position);
                    Vec::new()
                }
                MouseButton::Left => self.pointer_down(position, ctx),
                MouseButton::Right => Vec::new(),
            },
            PointerEvent::Move { position } => self.pointer_move(position, ctx),
            PointerEvent::Up { position, button } => match button {
                MouseButton::Middle => {
                    self.pan_anchor = None;
                    Vec::new()
                }
                MouseButton::Left => self.pointer_up(position, ctx),
                MouseButton::Right => Vec::new(),
            },
            PointerEvent::Scroll { position, delta } => {
                if self.input.modifiers.command() {
                    let step = ctx.config.zoom_step;
                    let factor = if delta.y < 0.0 { step } else { 1.0 / step };
                    vec![Effect::Zoom {
                        factor,
                        anchor: ZoomAnchor::Cursor(position),
                    }]
                } else {
                    vec![Effect::Pan(-delta)]
                }
            }
        }
    }

    fn pointer_down(&mut self, screen: Point, ctx: &ControllerContext) -> Vec<Effect> {
        let world = ctx.to_world(screen);
        let mut effects = Vec::new();

        if let ControllerState::Editing { id } = self.state {
            let inside = ctx.store.node(id).is_some_and(|n| n.bounds().contains(world));
            if inside {
                return effects;
            }
            effects.push(Effect::EndTextEdit { id });
            self.state = ControllerState::Idle;
        }
        if self.state.is_gesture() {
            // A press without the matching release; start over.
            self.state = ControllerState::Idle;
        }

        if self.input.is_double_click() {
            if let Some(node) = ctx.node_at(world, None) {
                effects.push(Effect::Select {
                    ids: vec![node.id],
                    additive: false,
                });
                effects.push(Effect::BeginTextEdit {
                    id: node.id,
                    content: node.content.clone(),
                });
                self.state = ControllerState::Editing { id: node.id };
                return effects;
            }
        }

        if let Some((id, origin)) = self.resize_handle_at(world, ctx) {
            self.state = ControllerState::Resizing { id, grab: world, origin };
            return effects;
        }

        let additive = self.input.modifiers.shift;
        match ctx.node_at(world, None) {
            Some(node) => {
                let tol = ctx.world_tolerance(ctx.config.anchor_tolerance);
                match hit_anchor(node.bounds(), world, tol) {
                    Some(side) if side != AnchorSide::Center => {
                        self.state = ControllerState::ConnectionDrawing(ConnectionPreview {
                            from: node.id,
                            from_anchor: side,
                            cursor: world,
                            target: None,
                        });
                        effects.push(Effect::RenderNeeded);
                    }
                    _ => {
                        let selected = ctx.store.is_selected(node.id);
                        let mut ids: Vec<NodeId> = if selected || additive {
                            ctx.store.selection().iter().copied().collect()
                        } else {
                            Vec::new()
                        };
                        if !selected {
                            ids.push(node.id);
                            effects.push(Effect::Select {
                                ids: vec![node.id],
                                additive,
                            });
                        }
                        let origins = ids
                            .into_iter()
                            .filter_map(|id| ctx.store.node(id).map(|n| (id, n.position)))
                            .collect();
                        self.state = ControllerState::Dragging { grab: world, origins };
                    }
                }
            }
            None => {
                if !additive {
                    effects.push(Effect::ClearSelection);
                }
                self.state = ControllerState::Selecting {
                    origin: world,
                    current: world,
                    additive,
                };
            }
        }
        effects
    }

    /// A selected node whose bottom-right resize handle is under `world`.
    fn resize_handle_at(&self, world: Point, ctx: &ControllerContext) -> Option<(NodeId, Rect)> {
        let tol = ctx.world_tolerance(ctx.config.handle_tolerance);
        ctx.store
            .selection()
            .iter()
            .filter_map(|id| ctx.store.node(*id))
            .find(|node| {
                let bounds = node.bounds();
                Point::new(bounds.x1, bounds.y1).distance(world) <= tol
            })
            .map(|node| (node.id, node.bounds()))
    }

    fn pointer_move(&mut self, screen: Point, ctx: &ControllerContext) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(last) = self.pan_anchor {
            if self.input.is_button_pressed(MouseButton::Middle) {
                effects.push(Effect::Pan(screen - last));
                self.pan_anchor = Some(screen);
            } else {
                self.pan_anchor = None;
            }
        }

        let world = ctx.to_world(screen);
        let mut mutations = Vec::new();
        match &mut self.state {
            ControllerState::Selecting { current, .. } => {
                *current = world;
                effects.push(Effect::RenderNeeded);
            }
            ControllerState::Dragging { grab, origins } => {
                let delta = world - *grab;
                for (id, origin) in origins.iter() {
                    mutations.push(LocalAction::UpdateNode {
                        id: *id,
                        patch: NodePatch::position(*origin + delta),
                    });
                }
            }
            ControllerState::Resizing { id, grab, origin } => {
                let delta = world - *grab;
                let size = Size::new(
                    (origin.width() + delta.x).max(MIN_NODE_EXTENT),
                    (origin.height() + delta.y).max(MIN_NODE_EXTENT),
                );
                mutations.push(LocalAction::UpdateNode {
                    id: *id,
                    patch: NodePatch::size(size),
                });
            }
            ControllerState::ConnectionDrawing(preview) => {
                preview.cursor = world;
                let tol = ctx.world_tolerance(ctx.config.anchor_tolerance);
                preview.target = ctx.node_at(world, Some(preview.from)).map(|node| {
                    let side = hit_anchor(node.bounds(), world, tol).unwrap_or(AnchorSide::Center);
                    (node.id, side)
                });
                effects.push(Effect::RenderNeeded);
            }
            ControllerState::Idle | ControllerState::Editing { .. } => {}
        }
        for action in mutations {
            self.push_mutation(&mut effects, action);
        }
        effects
    }

    fn pointer_up(&mut self, screen: Point, ctx: &ControllerContext) -> Vec<Effect> {
        let mut effects = Vec::new();
        match &self.state {
            ControllerState::Selecting { origin, additive, .. } => {
                let rect = Rect::from_points(*origin, ctx.to_world(screen));
                let ids: Vec<NodeId> = ctx
                    .index
                    .query(rect)
                    .into_iter()
                    .filter(|id| ctx.store.node(*id).is_some())
                    .collect();
                if !ids.is_empty() {
                    effects.push(Effect::Select {
                        ids,
                        additive: *additive,
                    });
                }
                effects.push(Effect::RenderNeeded);
            }
            ControllerState::ConnectionDrawing(preview) => {
                match preview.target {
                    Some((to, to_anchor)) if ctx.store.validate_endpoints(preview.from, to).is_ok() => {
                        let connection = Connection::new(preview.from, preview.from_anchor, to, to_anchor)
                            .with_routing(ctx.config.default_routing);
                        let bindings = connection.default_bindings();
                        self.push_mutation(&mut effects, LocalAction::AddConnection(connection));
                        for binding in bindings {
                            self.push_mutation(&mut effects, LocalAction::AddBinding(binding));
                        }
                    }
                    _ => log::debug!("Connection drawing released away from a node, cancelled"),
                }
                effects.push(Effect::RenderNeeded);
            }
            ControllerState::Editing { .. } => return effects,
            _ => {}
        }
        self.state = ControllerState::Idle;
        effects
    }

    pub fn handle_key(&mut self, event: &KeyEvent, ctx: &ControllerContext) -> Vec<Effect> {
        self.input.handle_key_event(event);
        let KeyEvent::Pressed(key) = event else {
            return Vec::new();
        };
        let mut effects = Vec::new();

        if let ControllerState::Editing { id } = self.state {
            // Everything else belongs to the text editor.
            if key == "Escape" {
                effects.push(Effect::EndTextEdit { id });
                self.state = ControllerState::Idle;
            }
            return effects;
        }

        match key.as_str() {
            "Escape" => return self.cancel(),
            "Enter" => {
                let selection = ctx.store.selection();
                if self.state == ControllerState::Idle && selection.len() == 1 {
                    let node = selection.iter().next().and_then(|id| ctx.store.node(*id));
                    if let Some(node) = node {
                        effects.push(Effect::BeginTextEdit {
                            id: node.id,
                            content: node.content.clone(),
                        });
                        self.state = ControllerState::Editing { id: node.id };
                    }
                }
            }
            "Delete" | "Backspace" if self.state == ControllerState::Idle => {
                let ids: Vec<NodeId> = ctx.store.selection().iter().copied().collect();
                for id in ids {
                    self.push_mutation(&mut effects, LocalAction::DeleteNode(id));
                }
                effects.push(Effect::ClearSelection);
            }
            "+" | "=" => effects.push(Effect::Zoom {
                factor: ctx.config.zoom_step,
                anchor: ZoomAnchor::ViewportCenter,
            }),
            "-" => effects.push(Effect::Zoom {
                factor: 1.0 / ctx.config.zoom_step,
                anchor: ZoomAnchor::ViewportCenter,
            }),
            _ => {}
        }
        effects
    }

    /// Abort a drag, resize, marquee or connection drawing. Mutations
    /// already emitted stay applied.
    pub fn cancel(&mut self) -> Vec<Effect> {
        self.pan_anchor = None;
        if self.state.is_gesture() {
            log::debug!("Cancelled {}", self.state.name());
            self.state = ControllerState::Idle;
            vec![Effect::RenderNeeded]
        } else {
            Vec::new()
        }
    }

    pub fn pointer_capture_lost(&mut self) -> Vec<Effect> {
        self.input.release_all();
        self.cancel()
    }

    /// The canvas lost focus: abort gestures and leave text editing.
    pub fn blur(&mut self) -> Vec<Effect> {
        self.input.release_all();
        let mut effects = self.cancel();
        if let ControllerState::Editing { id } = self.state {
            effects.push(Effect::EndTextEdit { id });
            self.state = ControllerState::Idle;
        }
        effects
    }

    /// Content reported by the text editor for the node being edited.
    pub fn commit_text(&mut self, id: NodeId, content: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.state {
            ControllerState::Editing { id: editing } if editing == id => {
                self.push_mutation(
                    &mut effects,
                    LocalAction::UpdateNode {
                        id,
                        patch: NodePatch::content(content),
                    },
                );
            }
            _ => log::warn!("Ignoring text for node {} which is not being edited", id),
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Stamp;
    use crate::model::NodeKind;

    struct Fixture {
        store: LocalStore,
        camera: Camera,
        index: SpatialIndex,
        config: EngineConfig,
    }

    impl Fixture {
        fn new(nodes: &[Node]) -> Self {
            let mut store = LocalStore::new(0.1, 10.0);
            let mut index = SpatialIndex::new(256.0);
            for node in nodes {
                store.add_node(node.clone(), Stamp::default());
                index.insert(node.id, node.bounds());
            }
            Self {
                store,
                camera: Camera::new(),
                index,
                config: EngineConfig::default(),
            }
        }

        fn ctx(&self) -> ControllerContext<'_> {
            ControllerContext {
                store: &self.store,
                camera: &self.camera,
                index: &self.index,
                config: &self.config,
            }
        }

        /// Apply selection effects the way the engine would.
        fn apply(&mut self, effects: &[Effect]) {
            for effect in effects {
                match effect {
                    Effect::Select { ids, additive } => {
                        self.store.select(ids, *additive);
                    }
                    Effect::ClearSelection => {
                        self.store.clear_selection();
                    }
                    _ => {}
                }
            }
        }
    }

    fn node(x: f64, y: f64) -> Node {
        Node::new(Point::new(x, y), Size::new(100.0, 100.0)).with_content("text")
    }

    fn down(x: f64, y: f64) -> PointerEvent {
        PointerEvent::Down {
            position: Point::new(x, y),
            button: MouseButton::Left,
        }
    }

    fn moved(x: f64, y: f64) -> PointerEvent {
        PointerEvent::Move {
            position: Point::new(x, y),
        }
    }

    fn up(x: f64, y: f64) -> PointerEvent {
        PointerEvent::Up {
            position: Point::new(x, y),
            button: MouseButton::Left,
        }
    }

    fn mutations(effects: &[Effect]) -> Vec<&LocalAction> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Mutate(action) => Some(action),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_drag_emits_position_updates() {
        let a = node(0.0, 0.0);
        let mut fx = Fixture::new(&[a.clone()]);
        let mut controller = CanvasController::new();

        let effects = controller.handle_pointer(&down(50.0, 50.0), &fx.ctx());
        fx.apply(&effects);
        assert_eq!(controller.state().name(), "dragging");

        let effects = controller.handle_pointer(&moved(80.0, 70.0), &fx.ctx());
        match mutations(&effects).as_slice() {
            [LocalAction::UpdateNode { id, patch }] => {
                assert_eq!(*id, a.id);
                assert_eq!(patch.position, Some(Point::new(30.0, 20.0)));
                assert!(patch.is_position_only());
            }
            other => panic!("unexpected {:?}", other),
        }

        controller.handle_pointer(&up(80.0, 70.0), &fx.ctx());
        assert_eq!(*controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_marquee_selects_intersecting_nodes() {
        let a = node(0.0, 0.0);
        let b = node(300.0, 0.0);
        let fx = Fixture::new(&[a.clone(), b.clone()]);
        let mut controller = CanvasController::new();

        let effects = controller.handle_pointer(&down(-50.0, -50.0), &fx.ctx());
        assert!(effects.contains(&Effect::ClearSelection));
        controller.handle_pointer(&moved(150.0, 150.0), &fx.ctx());
        assert_eq!(controller.marquee(), Some(Rect::new(-50.0, -50.0, 150.0, 150.0)));

        let effects = controller.handle_pointer(&up(150.0, 150.0), &fx.ctx());
        assert!(effects.contains(&Effect::Select {
            ids: vec![a.id],
            additive: false
        }));
        assert!(controller.marquee().is_none());
    }

    #[test]
    fn test_connection_drawing_commits_connection_and_bindings() {
        let a = node(0.0, 0.0);
        let b = node(300.0, 0.0);
        let fx = Fixture::new(&[a.clone(), b.clone()]);
        let mut controller = CanvasController::new();

        // Right anchor of A.
        controller.handle_pointer(&down(100.0, 50.0), &fx.ctx());
        assert!(controller.preview().is_some());

        // Left anchor of B.
        controller.handle_pointer(&moved(301.0, 50.0), &fx.ctx());
        assert_eq!(controller.preview().unwrap().target, Some((b.id, AnchorSide::Left)));

        let effects = controller.handle_pointer(&up(301.0, 50.0), &fx.ctx());
        let actions = mutations(&effects);
        assert_eq!(actions.len(), 3);
        match actions[0] {
            LocalAction::AddConnection(conn) => {
                assert_eq!(conn.start_node, a.id);
                assert_eq!(conn.end_node, b.id);
                assert_eq!(conn.start_anchor, AnchorSide::Right);
                assert_eq!(conn.end_anchor, AnchorSide::Left);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(actions[1], LocalAction::AddBinding(_)));
        assert!(matches!(actions[2], LocalAction::AddBinding(_)));
        assert!(controller.preview().is_none());
    }

    #[test]
    fn test_connection_released_on_empty_canvas_cancels() {
        let a = node(0.0, 0.0);
        let fx = Fixture::new(&[a]);
        let mut controller = CanvasController::new();
        controller.handle_pointer(&down(100.0, 50.0), &fx.ctx());
        controller.handle_pointer(&moved(600.0, 600.0), &fx.ctx());
        let effects = controller.handle_pointer(&up(600.0, 600.0), &fx.ctx());
        assert!(mutations(&effects).is_empty());
        assert_eq!(*controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_escape_aborts_drag_keeping_emitted_moves() {
        let a = node(0.0, 0.0);
        let mut fx = Fixture::new(&[a]);
        let mut controller = CanvasController::new();
        let effects = controller.handle_pointer(&down(50.0, 50.0), &fx.ctx());
        fx.apply(&effects);
        let moved_effects = controller.handle_pointer(&moved(60.0, 60.0), &fx.ctx());
        assert_eq!(mutations(&moved_effects).len(), 1);

        let effects = controller.handle_key(&KeyEvent::Pressed("Escape".into()), &fx.ctx());
        assert_eq!(effects, vec![Effect::RenderNeeded]);
        assert_eq!(*controller.state(), ControllerState::Idle);

        // Later moves do nothing.
        assert!(controller.handle_pointer(&moved(90.0, 90.0), &fx.ctx()).is_empty());
    }

    #[test]
    fn test_capture_loss_aborts_resize() {
        let a = node(0.0, 0.0);
        let mut fx = Fixture::new(&[a.clone()]);
        fx.store.select(&[a.id], false);
        let mut controller = CanvasController::new();

        controller.handle_pointer(&down(100.0, 100.0), &fx.ctx());
        assert_eq!(controller.state().name(), "resizing");
        let effects = controller.handle_pointer(&moved(150.0, 120.0), &fx.ctx());
        match mutations(&effects).as_slice() {
            [LocalAction::UpdateNode { patch, .. }] => {
                assert_eq!(patch.size, Some(Size::new(150.0, 120.0)));
            }
            other => panic!("unexpected {:?}", other),
        }

        controller.pointer_capture_lost();
        assert_eq!(*controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_enter_edits_and_commit_text_updates_content() {
        let a = node(0.0, 0.0);
        let mut fx = Fixture::new(&[a.clone()]);
        fx.store.select(&[a.id], false);
        let mut controller = CanvasController::new();

        let effects = controller.handle_key(&KeyEvent::Pressed("Enter".into()), &fx.ctx());
        assert_eq!(
            effects,
            vec![Effect::BeginTextEdit {
                id: a.id,
                content: "text".into()
            }]
        );

        let effects = controller.commit_text(a.id, "new text");
        match mutations(&effects).as_slice() {
            [LocalAction::UpdateNode { patch, .. }] => assert!(patch.is_content_only()),
            other => panic!("unexpected {:?}", other),
        }

        // Clicking outside the node leaves editing.
        let effects = controller.handle_pointer(&down(500.0, 500.0), &fx.ctx());
        assert_eq!(effects.first(), Some(&Effect::EndTextEdit { id: a.id }));
        assert_eq!(controller.state().name(), "selecting");
    }

    #[test]
    fn test_blur_ends_editing() {
        let a = node(0.0, 0.0);
        let mut fx = Fixture::new(&[a.clone()]);
        fx.store.select(&[a.id], false);
        let mut controller = CanvasController::new();
        controller.handle_key(&KeyEvent::Pressed("Enter".into()), &fx.ctx());
        assert_eq!(controller.blur(), vec![Effect::EndTextEdit { id: a.id }]);
        assert!(controller.commit_text(a.id, "late").is_empty());
    }

    #[test]
    fn test_delete_key_removes_selection() {
        let a = node(0.0, 0.0);
        let b = node(300.0, 0.0);
        let mut fx = Fixture::new(&[a.clone(), b.clone()]);
        fx.store.select(&[a.id, b.id], false);
        let mut controller = CanvasController::new();
        let effects = controller.handle_key(&KeyEvent::Pressed("Delete".into()), &fx.ctx());
        assert_eq!(mutations(&effects).len(), 2);
        assert_eq!(effects.last(), Some(&Effect::ClearSelection));
    }

    #[test]
    fn test_zoom_bindings() {
        let fx = Fixture::new(&[]);
        let mut controller = CanvasController::new();

        let effects = controller.handle_key(&KeyEvent::Pressed("+".into()), &fx.ctx());
        assert!(matches!(
            effects.as_slice(),
            [Effect::Zoom { anchor: ZoomAnchor::ViewportCenter, factor }] if *factor > 1.0
        ));

        controller.set_modifiers(Modifiers { ctrl: true, ..Default::default() });
        let cursor = Point::new(10.0, 20.0);
        let effects = controller.handle_pointer(
            &PointerEvent::Scroll {
                position: cursor,
                delta: Vec2::new(0.0, 3.0),
            },
            &fx.ctx(),
        );
        assert!(matches!(
            effects.as_slice(),
            [Effect::Zoom { anchor: ZoomAnchor::Cursor(p), factor }] if *p == cursor && *factor < 1.0
        ));
    }

    #[test]
    fn test_middle_drag_pans() {
        let fx = Fixture::new(&[]);
        let mut controller = CanvasController::new();
        controller.handle_pointer(
            &PointerEvent::Down {
                position: Point::new(10.0, 10.0),
                button: MouseButton::Middle,
            },
            &fx.ctx(),
        );
        let effects = controller.handle_pointer(&moved(25.0, 5.0), &fx.ctx());
        assert_eq!(effects, vec![Effect::Pan(Vec2::new(15.0, -5.0))]);
    }

    #[test]
    fn test_permits_table() {
        let id = NodeId::new_v4();
        let drag = ControllerState::Dragging {
            grab: Point::ZERO,
            origins: vec![(id, Point::ZERO)],
        };
        let position = LocalAction::UpdateNode { id, patch: NodePatch::position(Point::ZERO) };
        let content = LocalAction::UpdateNode { id, patch: NodePatch::content("x") };
        let kind = LocalAction::UpdateNode {
            id,
            patch: NodePatch { kind: Some(NodeKind::Sticky), ..Default::default() },
        };

        assert!(drag.permits(&position));
        assert!(!drag.permits(&content));
        assert!(ControllerState::Editing { id }.permits(&content));
        assert!(!ControllerState::Editing { id }.permits(&kind));
        assert!(!ControllerState::Selecting { origin: Point::ZERO, current: Point::ZERO, additive: false }
            .permits(&LocalAction::DeleteNode(id)));
        assert!(ControllerState::Idle.permits(&LocalAction::DeleteNode(id)));
    }
}
