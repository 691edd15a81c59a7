//! Sync bridge between the shared document and the local store.
//!
//! The document announces changes through handles that die with the
//! delivery cycle, and a handle can already be dead when the bridge gets
//! to it (a remount tore the cycle down). The bridge copies every entity
//! out of its handle immediately, guards each access on its own and the
//! batch as a whole, and parks anything it could not read in a pending
//! set that the next [`SyncBridge::tick`] re-reads from a stable snapshot.
//! Nothing ever unwinds out of the observer callback.

use crate::actions::{DocWrite, LocalAction};
use crate::crdt::{
    ChangeBatch, ChangeRecord, Collection, DocError, EntityKey, EntitySnapshot, ObserverId, SharedDocument, Stamp,
    decode_snapshot,
};
use crate::model::{BindingField, ConnectionField, NodeField, ViewportField};
use crate::store::LocalStore;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use uuid::Uuid;

/// Outcome of projecting one batch (or one retry tick) into the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionReport {
    /// Entities projected, whether or not they changed the store.
    pub applied: usize,
    /// Entities whose handle was revoked; queued for retry.
    pub skipped: Vec<EntityKey>,
    pub failures: Vec<String>,
    /// The batch guard tripped or the store was busy.
    pub aborted: bool,
}

impl ProjectionReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failures.is_empty() && !self.aborted
    }
}

#[derive(Debug, Default)]
struct BridgeState {
    pending: BTreeSet<EntityKey>,
    last_report: ProjectionReport,
}

enum Step {
    Applied,
    Skipped,
    Failed(String),
}

pub struct SyncBridge {
    store: Rc<RefCell<LocalStore>>,
    observer: Option<ObserverId>,
    state: Rc<RefCell<BridgeState>>,
}

impl SyncBridge {
    pub fn new(store: Rc<RefCell<LocalStore>>) -> Self {
        Self {
            store,
            observer: None,
            state: Rc::new(RefCell::new(BridgeState::default())),
        }
    }

    pub fn store(&self) -> &Rc<RefCell<LocalStore>> {
        &self.store
    }

    pub fn is_mounted(&self) -> bool {
        self.observer.is_some()
    }

    /// Start observing `doc` and project everything it already holds.
    /// Mounting an already-mounted bridge does nothing.
    pub fn mount(&mut self, doc: &mut SharedDocument) -> ProjectionReport {
        if let Some(id) = self.observer {
            if doc.is_observing(id) {
                return ProjectionReport::default();
            }
            log::warn!("Bridge observer {} was detached by the document, remounting", id);
        }

        let store = Rc::clone(&self.store);
        let state = Rc::clone(&self.state);
        let id = doc.observe(move |batch| {
            let report = project_batch(&store, &state, batch);
            state.borrow_mut().last_report = report;
        });
        self.observer = Some(id);

        let keys: Vec<EntityKey> = Collection::ALL
            .iter()
            .flat_map(|collection| doc.state().keys(*collection))
            .collect();
        let report = self.project_from_reads(doc, keys);
        log::debug!("Bridge mounted as observer {}, projected {} entities", id, report.applied);
        report
    }

    pub fn unmount(&mut self, doc: &mut SharedDocument) -> bool {
        match self.observer.take() {
            Some(id) => doc.unobserve(id),
            None => false,
        }
    }

    /// Re-project entities skipped by earlier batches.
    pub fn tick(&mut self, doc: &SharedDocument) -> ProjectionReport {
        if !self.is_mounted() {
            return ProjectionReport::default();
        }
        let keys: Vec<EntityKey> = self.state.borrow().pending.iter().cloned().collect();
        if keys.is_empty() {
            return ProjectionReport::default();
        }
        let report = self.project_from_reads(doc, keys);
        if report.applied > 0 {
            log::debug!("Retried {} pending entities", report.applied);
        }
        report
    }

    /// Write a local action to the document with the stamp it was applied
    /// to the store with, so the echo projects as a no-op.
    pub fn commit(&self, doc: &mut SharedDocument, action: &LocalAction, stamp: Stamp) -> Result<(), DocError> {
        for write in action.doc_writes() {
            match write {
                DocWrite::Put(key, values) => doc.put_stamped(key, values, stamp)?,
                DocWrite::Delete(key) => doc.delete_stamped(key, stamp)?,
            }
        }
        Ok(())
    }

    pub fn pending(&self) -> Vec<EntityKey> {
        self.state.borrow().pending.iter().cloned().collect()
    }

    pub fn last_report(&self) -> ProjectionReport {
        self.state.borrow().last_report.clone()
    }

    fn project_from_reads(&mut self, doc: &SharedDocument, keys: Vec<EntityKey>) -> ProjectionReport {
        let mut report = ProjectionReport::default();
        let Ok(mut store) = self.store.try_borrow_mut() else {
            report.aborted = true;
            report.failures.push("store busy".to_string());
            self.state.borrow_mut().pending.extend(keys);
            return report;
        };
        let mut state = self.state.borrow_mut();
        for key in keys {
            let Some(snapshot) = doc.read(&key) else {
                state.pending.remove(&key);
                continue;
            };
            match guarded(|| project_snapshot(&mut store, &snapshot)) {
                Step::Applied => {
                    state.pending.remove(&key);
                    report.applied += 1;
                }
                Step::Skipped => {
                    state.pending.insert(key.clone());
                    report.skipped.push(key);
                }
                Step::Failed(reason) => {
                    state.pending.insert(key);
                    report.failures.push(reason);
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBridge")
            .field("observer", &self.observer)
            .field("pending", &self.state.borrow().pending.len())
            .finish()
    }
}

/// Run one entity projection, turning revocation, errors and panics into
/// a [`Step`].
fn guarded(f: impl FnOnce() -> Result<bool, DocError>) -> Step {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(_)) => Step::Applied,
        Ok(Err(DocError::RevokedHandle { .. })) => Step::Skipped,
        Ok(Err(e)) => Step::Failed(e.to_string()),
        Err(_) => Step::Failed("panic while projecting".to_string()),
    }
}

fn project_batch(store: &RefCell<LocalStore>, state: &RefCell<BridgeState>, batch: &ChangeBatch) -> ProjectionReport {
    let mut report = ProjectionReport::default();
    let mut records: Vec<&ChangeRecord> = batch.records.iter().collect();
    // Nodes before the connections and bindings that point at them.
    records.sort_by(|a, b| a.key.cmp(&b.key));

    let Ok(mut store) = store.try_borrow_mut() else {
        log::warn!("Store busy during change delivery, deferring {} entities", records.len());
        report.aborted = true;
        report.failures.push("store busy".to_string());
        state.borrow_mut().pending.extend(records.iter().map(|r| r.key.clone()));
        return report;
    };

    let mut done = 0;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        for record in &records {
            let step = guarded(|| {
                let snapshot = record.after.read()?.clone();
                project_snapshot(&mut store, &snapshot)
            });
            let mut state = state.borrow_mut();
            match step {
                Step::Applied => {
                    state.pending.remove(&record.key);
                    report.applied += 1;
                }
                Step::Skipped => {
                    log::debug!("Handle for {} revoked before projection, queued for retry", record.key);
                    state.pending.insert(record.key.clone());
                    report.skipped.push(record.key.clone());
                }
                Step::Failed(reason) => {
                    log::warn!("Failed to project {}: {}", record.key, reason);
                    state.pending.insert(record.key.clone());
                    report.failures.push(reason);
                }
            }
            done += 1;
        }
    }));

    if outcome.is_err() {
        let rest = &records[done.min(records.len())..];
        log::error!("Batch projection aborted, deferring {} entities", rest.len());
        report.aborted = true;
        if let Ok(mut state) = state.try_borrow_mut() {
            state.pending.extend(rest.iter().map(|r| r.key.clone()));
        }
    }
    report
}

fn parse_id(key: &EntityKey) -> Result<Uuid, DocError> {
    Uuid::parse_str(&key.id).map_err(|_| DocError::Decode(format!("bad entity id {}", key)))
}

fn log_decode_errors(key: &EntityKey, errors: Vec<DocError>) {
    for e in errors {
        log::warn!("Dropping field of {}: {}", key, e);
    }
}

/// Copy a detached snapshot into the store. Returns whether it changed.
fn project_snapshot(store: &mut LocalStore, snapshot: &EntitySnapshot) -> Result<bool, DocError> {
    let key = &snapshot.key;
    let changed = match key.collection {
        Collection::Nodes => {
            let id = parse_id(key)?;
            let (fields, errors) = decode_snapshot::<NodeField>(snapshot);
            log_decode_errors(key, errors);
            store.apply_node_fields(id, fields)
        }
        Collection::Connections => {
            let id = parse_id(key)?;
            let (fields, errors) = decode_snapshot::<ConnectionField>(snapshot);
            log_decode_errors(key, errors);
            store.apply_connection_fields(id, fields)
        }
        Collection::Bindings => {
            let id = parse_id(key)?;
            let (fields, errors) = decode_snapshot::<BindingField>(snapshot);
            log_decode_errors(key, errors);
            store.apply_binding_fields(id, fields)
        }
        Collection::Viewports => {
            let (fields, errors) = decode_snapshot::<ViewportField>(snapshot);
            log_decode_errors(key, errors);
            store.apply_viewport_fields(key.id.clone(), fields)
        }
    };
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{ManualClock, fields_to_values};
    use crate::model::{Entity, Node, NodePatch};
    use kurbo::{Point, Size};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn local() -> (SharedDocument, SyncBridge) {
        let doc = SharedDocument::with_clock(1, Box::new(ManualClock::new(1000)));
        let store = Rc::new(RefCell::new(LocalStore::new(0.1, 10.0)));
        (doc, SyncBridge::new(store))
    }

    fn remote(clock: i64) -> SharedDocument {
        SharedDocument::with_clock(2, Box::new(ManualClock::new(clock)))
    }

    fn put_node(doc: &mut SharedDocument, node: &Node) {
        doc.put(EntityKey::node(node.id), fields_to_values(&node.fields()))
            .unwrap();
    }

    #[test]
    fn test_mount_projects_existing_state() {
        let (mut doc, mut bridge) = local();
        let node = Node::new(Point::new(10.0, 20.0), Size::new(100.0, 50.0));
        put_node(&mut doc, &node);

        let report = bridge.mount(&mut doc);
        assert_eq!(report.applied, 1);
        assert_eq!(bridge.store().borrow().node(node.id).unwrap().position, Point::new(10.0, 20.0));

        // Second mount is a no-op.
        assert_eq!(bridge.mount(&mut doc), ProjectionReport::default());
        assert_eq!(doc.observer_count(), 1);
    }

    #[test]
    fn test_remote_batch_reaches_store() {
        let (mut doc, mut bridge) = local();
        bridge.mount(&mut doc);

        let mut peer = remote(2000);
        let node = Node::new(Point::new(5.0, 5.0), Size::new(40.0, 40.0)).with_content("hello");
        put_node(&mut peer, &node);
        doc.apply_remote(&peer.take_pending().unwrap());

        let store = bridge.store().borrow();
        assert_eq!(store.node(node.id).unwrap().content, "hello");
        assert!(bridge.last_report().is_clean());
    }

    #[test]
    fn test_revoked_entity_is_skipped_then_retried() {
        init_logs();
        let (mut doc, mut bridge) = local();
        bridge.mount(&mut doc);

        let mut peer = remote(2000);
        let nodes: Vec<Node> = (0..3)
            .map(|i| Node::new(Point::new(i as f64 * 10.0, 0.0), Size::new(10.0, 10.0)))
            .collect();
        for node in &nodes {
            put_node(&mut peer, node);
        }
        doc.apply_remote(&peer.take_pending().unwrap());
        assert_eq!(bridge.store().borrow().node_count(), 3);

        // Move all three; the handle for the middle one dies before delivery.
        for node in &nodes {
            let patch = NodePatch::position(Point::new(500.0, 500.0));
            peer.put(EntityKey::node(node.id), fields_to_values(&patch.fields()))
                .unwrap();
        }
        let revoked = EntityKey::node(nodes[1].id);
        doc.inject_revocation(revoked.clone());
        doc.apply_remote(&peer.take_pending().unwrap());

        let report = bridge.last_report();
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, vec![revoked.clone()]);
        assert!(!report.aborted);
        assert!(doc.is_observing(bridge.observer.unwrap()));
        {
            let store = bridge.store().borrow();
            assert_eq!(store.node(nodes[0].id).unwrap().position, Point::new(500.0, 500.0));
            assert_eq!(store.node(nodes[1].id).unwrap().position, Point::new(10.0, 0.0));
            assert_eq!(store.node(nodes[2].id).unwrap().position, Point::new(500.0, 500.0));
        }
        assert_eq!(bridge.pending(), vec![revoked]);

        let retry = bridge.tick(&doc);
        assert_eq!(retry.applied, 1);
        assert!(bridge.pending().is_empty());
        assert_eq!(
            bridge.store().borrow().node(nodes[1].id).unwrap().position,
            Point::new(500.0, 500.0)
        );
    }

    #[test]
    fn test_replayed_batch_changes_nothing() {
        let (mut doc, mut bridge) = local();
        bridge.mount(&mut doc);

        let mut peer = remote(2000);
        put_node(&mut peer, &Node::new(Point::ZERO, Size::new(10.0, 10.0)));
        let batch = peer.take_pending().unwrap();
        doc.apply_remote(&batch);
        let revision = bridge.store().borrow().revision();

        doc.apply_remote(&batch);
        // Project the same record directly as well: stamps are not newer.
        let key = batch.entries[0].key();
        let snapshot = doc.read(&key).unwrap();
        assert!(!project_snapshot(&mut bridge.store().borrow_mut(), &snapshot).unwrap());
        assert_eq!(bridge.store().borrow().revision(), revision);
    }

    #[test]
    fn test_local_commit_echo_is_noop() {
        let (mut doc, mut bridge) = local();
        bridge.mount(&mut doc);

        let node = Node::new(Point::new(1.0, 2.0), Size::new(30.0, 30.0));
        let action = LocalAction::AddNode(node.clone());
        let stamp = doc.tick();
        action.apply_to_store(&mut bridge.store().borrow_mut(), stamp).unwrap();
        let revision = bridge.store().borrow().revision();

        bridge.commit(&mut doc, &action, stamp).unwrap();
        assert_eq!(bridge.store().borrow().revision(), revision);
        assert!(doc.read(&EntityKey::node(node.id)).is_some());
        assert!(doc.has_pending());
    }

    #[test]
    fn test_busy_store_defers_whole_batch() {
        let (mut doc, mut bridge) = local();
        bridge.mount(&mut doc);

        let mut peer = remote(2000);
        let node = Node::new(Point::ZERO, Size::new(10.0, 10.0));
        put_node(&mut peer, &node);
        let batch = peer.take_pending().unwrap();
        {
            let _held = bridge.store().borrow_mut();
            doc.apply_remote(&batch);
        }
        assert!(bridge.last_report().aborted);
        assert_eq!(bridge.pending(), vec![EntityKey::node(node.id)]);

        bridge.tick(&doc);
        assert!(bridge.store().borrow().node(node.id).is_some());
        assert!(bridge.pending().is_empty());
    }

    #[test]
    fn test_panicking_subscriber_does_not_detach_bridge() {
        init_logs();
        let (mut doc, mut bridge) = local();
        bridge.mount(&mut doc);
        bridge
            .store()
            .borrow_mut()
            .subscribe_deltas(|_| panic!("subscriber failure"));

        let mut peer = remote(2000);
        put_node(&mut peer, &Node::new(Point::ZERO, Size::new(10.0, 10.0)));
        doc.apply_remote(&peer.take_pending().unwrap());

        let report = bridge.last_report();
        assert_eq!(report.failures.len(), 1);
        assert!(doc.is_observing(bridge.observer.unwrap()));
    }

    #[test]
    fn test_remount_catches_up() {
        let (mut doc, mut bridge) = local();
        bridge.mount(&mut doc);
        assert!(bridge.unmount(&mut doc));
        assert!(!bridge.is_mounted());

        let mut peer = remote(2000);
        let node = Node::new(Point::new(7.0, 7.0), Size::new(10.0, 10.0));
        put_node(&mut peer, &node);
        doc.apply_remote(&peer.take_pending().unwrap());
        assert!(bridge.store().borrow().node(node.id).is_none());

        bridge.mount(&mut doc);
        assert!(bridge.store().borrow().node(node.id).is_some());
    }
}
