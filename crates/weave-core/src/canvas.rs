//! The canvas engine: one object that owns the document, the store and
//! everything between them and the host.
//!
//! Local mutations follow one path. A stamp is issued by the document
//! clock, the action is applied to the store under that stamp, then the
//! same write goes to the document. The bridge sees the echo, finds every
//! field already at that stamp and leaves the store alone. Remote updates
//! take the other path, document first and then the bridge.

use crate::actions::LocalAction;
use crate::bridge::{ProjectionReport, SyncBridge};
use crate::camera::Camera;
use crate::collaboration::CollaborationSession;
use crate::config::{ConfigError, EngineConfig};
use crate::controller::{CanvasController, ControllerContext, Effect};
use crate::crdt::{DocError, EntityKey, FieldValues, SharedDocument, Stamp, UpdateBatch, fields_to_values};
use crate::input::{KeyEvent, Modifiers, PointerEvent};
use crate::model::{
    AnchorSide, Connection, ConnectionId, Entity, Node, NodeId, NodePatch, RoutingType, UserId, ViewportState,
};
use crate::persistence::{PersistError, SaveStatus, WorkspaceRows, WriteOp, WriteScheduler};
use crate::render::{Frame, RendererTable, build_frame};
use crate::routing::cascade_targets;
use crate::spatial::Culler;
use crate::store::{CanvasSnapshot, LocalStore, StoreDelta, StoreError, SubscriberId};
use crate::sync::SyncEvent;
use kurbo::{Point, Size, Vec2};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Document error: {0}")]
    Document(#[from] DocError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Who is editing, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub user_id: UserId,
    pub workspace_id: String,
}

impl SessionContext {
    pub fn new(user_id: impl Into<UserId>, workspace_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
        }
    }
}

/// Host-provided text editor for node content.
///
/// The engine hands over the current content when editing starts; the
/// editor reports committed text back through
/// [`CanvasEngine::commit_text`].
pub trait TextEditor {
    fn begin(&mut self, node: NodeId, content: &str);

    fn end(&mut self, node: NodeId);
}

pub struct CanvasEngine {
    config: EngineConfig,
    context: SessionContext,
    doc: SharedDocument,
    store: Rc<RefCell<LocalStore>>,
    bridge: SyncBridge,
    camera: Camera,
    culler: Culler,
    /// Store deltas not yet seen by the culler.
    deltas: Rc<RefCell<Vec<StoreDelta>>>,
    controller: CanvasController,
    renderers: RendererTable,
    session: CollaborationSession,
    scheduler: Option<WriteScheduler>,
    text_editor: Option<Box<dyn TextEditor>>,
    /// Viewport last written to the document.
    saved_view: Option<(Vec2, f64)>,
}

impl CanvasEngine {
    pub fn new(config: EngineConfig, context: SessionContext) -> Self {
        let doc = SharedDocument::new(SharedDocument::random_peer());
        Self::with_document(config, context, doc)
    }

    pub fn from_config_file(path: impl AsRef<Path>, context: SessionContext) -> Result<Self, EngineError> {
        Ok(Self::new(EngineConfig::load(path)?, context))
    }

    /// Build an engine around an existing document (e.g. one with a manual
    /// clock, or one already holding state).
    pub fn with_document(config: EngineConfig, context: SessionContext, mut doc: SharedDocument) -> Self {
        let config = config.validate();
        let store = Rc::new(RefCell::new(LocalStore::new(config.min_scale, config.max_scale)));
        let deltas = Rc::new(RefCell::new(Vec::new()));
        {
            let deltas = Rc::clone(&deltas);
            store
                .borrow_mut()
                .subscribe_deltas(move |batch| deltas.borrow_mut().extend_from_slice(batch));
        }

        let mut bridge = SyncBridge::new(Rc::clone(&store));
        let report = bridge.mount(&mut doc);
        if !report.is_clean() {
            log::warn!("Initial projection incomplete: {:?}", report);
        }

        let mut culler = Culler::new(config.cull_tile_size, config.cull_padding);
        culler.rebuild(&store.borrow());
        deltas.borrow_mut().clear();

        let session = CollaborationSession::new(doc.peer_id(), context.user_id.clone());
        log::info!(
            "Canvas engine ready for {} in workspace {} (peer {})",
            context.user_id,
            context.workspace_id,
            doc.peer_id()
        );
        Self {
            camera: Camera::from_config(&config),
            config,
            context,
            doc,
            store,
            bridge,
            culler,
            deltas,
            controller: CanvasController::new(),
            renderers: RendererTable::default(),
            session,
            scheduler: None,
            text_editor: None,
            saved_view: None,
        }
    }

    /// Persist local changes through `scheduler`.
    pub fn with_scheduler(mut self, scheduler: WriteScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn set_text_editor(&mut self, editor: Box<dyn TextEditor>) {
        self.text_editor = Some(editor);
    }

    // --- Accessors ---

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn store(&self) -> std::cell::Ref<'_, LocalStore> {
        self.store.borrow()
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn controller(&self) -> &CanvasController {
        &self.controller
    }

    pub fn renderers_mut(&mut self) -> &mut RendererTable {
        &mut self.renderers
    }

    pub fn session(&self) -> &CollaborationSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut CollaborationSession {
        &mut self.session
    }

    pub fn visible_nodes(&self) -> &[NodeId] {
        self.culler.visible()
    }

    // --- Imperative API ---

    /// Add a node. Returns its id.
    pub fn create_node(&mut self, node: Node) -> NodeId {
        let id = node.id;
        self.dispatch_logged(LocalAction::AddNode(node));
        id
    }

    /// Connect two nodes and bind both ends. Invalid endpoints (missing,
    /// deleted or identical nodes) are a logged no-op.
    pub fn create_connection(
        &mut self,
        start: NodeId,
        start_anchor: AnchorSide,
        end: NodeId,
        end_anchor: AnchorSide,
        routing: Option<RoutingType>,
    ) -> Option<ConnectionId> {
        if let Err(e) = self.store.borrow().validate_endpoints(start, end) {
            log::warn!("Not connecting {} to {}: {}", start, end, e);
            return None;
        }
        let connection = Connection::new(start, start_anchor, end, end_anchor)
            .with_routing(routing.unwrap_or(self.config.default_routing));
        let id = connection.id;
        let bindings = connection.default_bindings();
        if !self.dispatch_logged(LocalAction::AddConnection(connection)) {
            return None;
        }
        for binding in bindings {
            self.dispatch_logged(LocalAction::AddBinding(binding));
        }
        Some(id)
    }

    pub fn update_node(&mut self, id: NodeId, patch: NodePatch) -> bool {
        if self.store.borrow().node(id).is_none() {
            log::warn!("Not updating unknown node {}", id);
            return false;
        }
        self.dispatch_logged(LocalAction::UpdateNode { id, patch })
    }

    /// Tombstone a node together with every connection and binding
    /// attached to it.
    pub fn delete_node(&mut self, id: NodeId) -> bool {
        if self.store.borrow().node(id).is_none() {
            return false;
        }
        let cascade = cascade_targets(&self.store.borrow(), id);
        if !cascade.is_empty() {
            log::debug!(
                "Deleting node {} cascades to {} connections and {} bindings",
                id,
                cascade.connections.len(),
                cascade.bindings.len()
            );
        }
        for conn in cascade.connections {
            self.dispatch_logged(LocalAction::DeleteConnection(conn));
        }
        for binding in cascade.bindings {
            self.dispatch_logged(LocalAction::DeleteBinding(binding));
        }
        let deleted = self.dispatch_logged(LocalAction::DeleteNode(id));
        self.publish_selection();
        deleted
    }

    /// Move the camera and record the viewport for this user.
    pub fn set_viewport(&mut self, offset: Vec2, scale: f64) {
        let (min, max) = self.store.borrow().scale_limits();
        let state = ViewportState::new(self.context.user_id.clone(), offset, scale).clamped(min, max);
        self.camera.apply_state(&state);
        self.save_viewport(state);
    }

    pub fn set_viewport_size(&mut self, size: Size) {
        self.camera.set_viewport_size(size);
    }

    pub fn export_snapshot(&self) -> CanvasSnapshot {
        self.store.borrow().snapshot()
    }

    /// The full replicated state, for saving or seeding another replica.
    pub fn export_document(&self) -> UpdateBatch {
        self.doc.export_snapshot()
    }

    pub fn select(&mut self, ids: &[NodeId], additive: bool) {
        self.store.borrow_mut().select(ids, additive);
        self.publish_selection();
    }

    pub fn clear_selection(&mut self) {
        self.store.borrow_mut().clear_selection();
        self.publish_selection();
    }

    fn publish_selection(&mut self) {
        let selection = self.store.borrow().selection().iter().copied().collect();
        self.session.set_selection(selection);
    }

    // --- Input ---

    /// Returns true if the canvas needs a redraw.
    pub fn handle_pointer(&mut self, event: &PointerEvent) -> bool {
        let effects = {
            let store = self.store.borrow();
            let ctx = ControllerContext {
                store: &store,
                camera: &self.camera,
                index: self.culler.index(),
                config: &self.config,
            };
            self.controller.handle_pointer(event, &ctx)
        };
        if let PointerEvent::Move { position } = event {
            let world = self.camera.screen_to_world(*position);
            self.session.set_cursor(world.x, world.y);
        }
        self.apply_effects(effects)
    }

    pub fn handle_key(&mut self, event: &KeyEvent) -> bool {
        let effects = {
            let store = self.store.borrow();
            let ctx = ControllerContext {
                store: &store,
                camera: &self.camera,
                index: self.culler.index(),
                config: &self.config,
            };
            self.controller.handle_key(event, &ctx)
        };
        self.apply_effects(effects)
    }

    pub fn set_modifiers(&mut self, modifiers: Modifiers) {
        self.controller.set_modifiers(modifiers);
    }

    pub fn pointer_capture_lost(&mut self) -> bool {
        let effects = self.controller.pointer_capture_lost();
        self.apply_effects(effects)
    }

    pub fn blur(&mut self) -> bool {
        let effects = self.controller.blur();
        self.session.clear_cursor();
        self.apply_effects(effects)
    }

    /// Text committed by the text editor for the node being edited.
    pub fn commit_text(&mut self, id: NodeId, content: &str) -> bool {
        let effects = self.controller.commit_text(id, content);
        self.apply_effects(effects)
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) -> bool {
        let redraw = !effects.is_empty();
        for effect in effects {
            match effect {
                Effect::Mutate(LocalAction::DeleteNode(id)) => {
                    self.delete_node(id);
                }
                Effect::Mutate(action) => {
                    self.dispatch_logged(action);
                }
                Effect::Select { ids, additive } => self.select(&ids, additive),
                Effect::ClearSelection => self.clear_selection(),
                Effect::BeginTextEdit { id, content } => match self.text_editor.as_mut() {
                    Some(editor) => editor.begin(id, &content),
                    None => log::debug!("No text editor attached, node {} not editable", id),
                },
                Effect::EndTextEdit { id } => {
                    if let Some(editor) = self.text_editor.as_mut() {
                        editor.end(id);
                    }
                }
                Effect::Pan(delta) => self.camera.pan(delta),
                Effect::Zoom { factor, anchor } => {
                    self.camera.zoom(factor, anchor);
                }
                Effect::RenderNeeded => {}
            }
        }
        redraw
    }

    // --- Local action dispatch ---

    /// Apply a local action: store first, then the document under the
    /// same stamp, then persistence.
    pub fn dispatch(&mut self, mut action: LocalAction) -> Result<bool, EngineError> {
        let stamp = self.doc.tick();
        action.stamp_audit(&self.context.user_id, self.doc.now_millis());
        let changed = action.apply_to_store(&mut self.store.borrow_mut(), stamp)?;
        self.bridge.commit(&mut self.doc, &action, stamp)?;
        self.schedule_write(&action.target());
        Ok(changed)
    }

    fn dispatch_logged(&mut self, action: LocalAction) -> bool {
        let name = action.name();
        match self.dispatch(action) {
            Ok(changed) => changed,
            Err(e) => {
                log::warn!("Dropped {}: {}", name, e);
                false
            }
        }
    }

    fn schedule_write(&mut self, key: &EntityKey) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        if let Some(op) = WriteOp::capture(&self.store.borrow(), &self.context.workspace_id, key) {
            scheduler.schedule(op, Instant::now());
        }
    }

    fn save_viewport(&mut self, state: ViewportState) {
        self.saved_view = Some((state.offset, state.scale));
        self.dispatch_logged(LocalAction::SetViewport(state));
    }

    // --- Frame loop ---

    /// Advance one frame. Moves the camera, folds store changes into the
    /// culler, retries skipped projections, repairs connections left
    /// dangling by concurrent deletes and records a settled viewport.
    /// Returns true if anything visible changed.
    pub fn update(&mut self, dt: f64) -> bool {
        let mut changed = self.camera.update(dt);

        let retry = self.bridge.tick(&self.doc);
        changed |= retry.applied > 0;
        changed |= self.repair_dangling();

        let deltas = std::mem::take(&mut *self.deltas.borrow_mut());
        if !deltas.is_empty() {
            self.culler.apply_deltas(&self.store.borrow(), &deltas);
            changed = true;
        }
        changed |= self.culler.recompute(&self.camera);

        if self.camera.is_settled() {
            let view = (self.camera.offset, self.camera.scale);
            if self.saved_view != Some(view) {
                self.save_viewport(self.camera.to_state(&self.context.user_id));
            }
        }
        changed
    }

    /// Tombstone connections whose endpoint was deleted on another replica
    /// while this one was connecting to it.
    fn repair_dangling(&mut self) -> bool {
        let dangling = self.store.borrow().dangling_connections();
        for conn in &dangling {
            let bindings: Vec<_> = self
                .store
                .borrow()
                .bindings_for_connection(*conn)
                .into_iter()
                .map(|b| b.id)
                .collect();
            log::debug!("Removing dangling connection {}", conn);
            self.dispatch_logged(LocalAction::DeleteConnection(*conn));
            for binding in bindings {
                self.dispatch_logged(LocalAction::DeleteBinding(binding));
            }
        }
        !dangling.is_empty()
    }

    /// Display list for the current view.
    pub fn frame(&self) -> Frame {
        build_frame(
            &self.store.borrow(),
            &self.camera,
            self.culler.visible(),
            &self.renderers,
            &self.controller,
            self.config.arrow_head_size,
        )
    }

    // --- Replication ---

    /// Merge a batch from another replica. Returns how many entities
    /// changed.
    pub fn apply_remote(&mut self, batch: &UpdateBatch) -> usize {
        self.doc.apply_remote(batch)
    }

    /// Drain local writes for a host that runs its own transport instead
    /// of the collaboration session.
    pub fn take_local_updates(&mut self) -> Option<UpdateBatch> {
        self.doc.take_pending()
    }

    pub fn join_workspace(&mut self) {
        let workspace = self.context.workspace_id.clone();
        self.session.join(&workspace);
    }

    pub fn leave_workspace(&mut self) {
        self.session.leave();
    }

    pub fn handle_server_message(&mut self, json: &str) -> Option<SyncEvent> {
        self.session.handle_message(json, &mut self.doc)
    }

    /// Frames for the relay, local updates included.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        self.session.queue_updates(&mut self.doc);
        self.session.take_outgoing()
    }

    /// Tear the bridge down and mount it again, re-projecting the whole
    /// document.
    pub fn remount_bridge(&mut self) -> ProjectionReport {
        self.bridge.unmount(&mut self.doc);
        self.bridge.mount(&mut self.doc)
    }

    // --- Persistence ---

    /// Send due writes. `None` without a scheduler.
    pub async fn flush_persistence(&mut self, now: Instant) -> Option<SaveStatus> {
        let scheduler = self.scheduler.as_mut()?;
        scheduler.flush_due(now).await;
        Some(scheduler.status())
    }

    pub fn save_status(&self) -> SaveStatus {
        self.scheduler.as_ref().map_or(SaveStatus::Saved, WriteScheduler::status)
    }

    /// Seed the document from persisted rows. Rows are stamped below every
    /// live write (see [`hydrate_stamp`]), so anything already in the
    /// document or arriving from peers takes precedence.
    pub fn hydrate(&mut self, rows: WorkspaceRows) -> Result<usize, EngineError> {
        let mut count = 0;
        for row in rows.nodes {
            let node = row.into_node();
            let values = fields_to_values(&node.fields());
            let stamp = hydrate_stamp(node.updated_at, &values);
            self.doc.put_stamped(EntityKey::node(node.id), values, stamp)?;
            count += 1;
        }
        for row in rows.connections {
            let conn = row.into_connection();
            let values = fields_to_values(&conn.fields());
            let stamp = hydrate_stamp(0, &values);
            self.doc.put_stamped(EntityKey::connection(conn.id), values, stamp)?;
            count += 1;
        }
        for row in rows.bindings {
            let binding = row.into_binding();
            let values = fields_to_values(&binding.fields());
            let stamp = hydrate_stamp(0, &values);
            self.doc.put_stamped(EntityKey::binding(binding.id), values, stamp)?;
            count += 1;
        }
        for row in rows.viewports {
            let viewport = row.into_viewport();
            if viewport.owner == self.context.user_id {
                self.camera.apply_state(&viewport);
                self.saved_view = Some((self.camera.offset, self.camera.scale));
            }
            let values = fields_to_values(&viewport.fields());
            let stamp = hydrate_stamp(viewport.updated_at, &values);
            self.doc.put_stamped(EntityKey::viewport(&viewport.owner), values, stamp)?;
            count += 1;
        }
        log::info!("Hydrated {} entities for workspace {}", count, self.context.workspace_id);
        Ok(count)
    }

    /// Load the workspace through the scheduler's gateway and hydrate it.
    pub async fn restore(&mut self) -> Result<usize, EngineError> {
        let Some(scheduler) = self.scheduler.as_ref() else {
            return Ok(0);
        };
        let gateway = Arc::clone(scheduler.gateway());
        let rows = match gateway.load_workspace(&self.context.workspace_id).await {
            Ok(rows) => rows,
            Err(PersistError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        self.hydrate(rows)
    }

    // --- Subscriptions ---

    pub fn subscribe_deltas(&mut self, callback: impl FnMut(&[StoreDelta]) + 'static) -> SubscriberId {
        self.store.borrow_mut().subscribe_deltas(callback)
    }

    pub fn subscribe_snapshots(&mut self, callback: impl FnMut(&CanvasSnapshot) + 'static) -> SubscriberId {
        self.store.borrow_mut().subscribe_snapshots(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.store.borrow_mut().unsubscribe(id)
    }

    /// World-space point under a screen position.
    pub fn screen_to_world(&self, screen: Point) -> Point {
        self.camera.screen_to_world(screen)
    }
}

impl std::fmt::Debug for CanvasEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasEngine")
            .field("context", &self.context)
            .field("peer", &self.doc.peer_id())
            .field("bridge", &self.bridge)
            .field("controller", &self.controller.state().name())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Time of the oldest hydrated row. Every hydrate stamp is negative and
/// sorts below any stamp issued by a clock.
const HYDRATE_FLOOR: i64 = i64::MIN / 2;

/// Stamp for a persisted row: ordered by `updated_at`, then by an FNV-1a
/// digest of the row's values. Two replicas restoring different versions
/// of one row pick the same winner.
fn hydrate_stamp(updated_at: i64, values: &FieldValues) -> Stamp {
    let digest = serde_json::to_vec(values)
        .unwrap_or_default()
        .iter()
        .fold(0x811c_9dc5_u32, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(0x0100_0193));
    Stamp {
        time: HYDRATE_FLOOR + updated_at.clamp(0, i64::MAX / 2),
        counter: digest,
        peer: 0,
    }
}
