//! The shared, replica-convergent document.

use super::DocError;
use super::clock::{ClockSource, HybridClock, PeerId, Stamp, SystemClock};
use super::handle::{ChangeBatch, ChangeKind, ChangeOrigin, ChangeRecord, UpdateCycle};
use super::schema::{
    DELETED_FIELD, DocState, EntityDelta, EntityKey, EntitySnapshot, FieldValues, FieldWrite, UpdateBatch,
};
use serde_json::Value;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};

pub type ObserverId = u64;

type Observer = Box<dyn FnMut(&ChangeBatch)>;

/// Replicated map-of-maps with per-field last-writer-wins merge.
///
/// Local writes are applied immediately and queued in an outbox; remote
/// batches are merged on arrival. Every merge that changes something is
/// announced to observers as a [`ChangeBatch`] whose handles are revoked
/// as soon as the last observer returns.
pub struct SharedDocument {
    state: DocState,
    clock: HybridClock,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: ObserverId,
    outbox: Vec<EntityDelta>,
    revoke_next: HashSet<EntityKey>,
}

impl SharedDocument {
    /// Create an empty document stamped by the system clock.
    pub fn new(peer: PeerId) -> Self {
        Self::with_clock(peer, Box::new(SystemClock))
    }

    pub fn with_clock(peer: PeerId, source: Box<dyn ClockSource>) -> Self {
        Self {
            state: DocState::new(),
            clock: HybridClock::new(peer, source),
            observers: Vec::new(),
            next_observer: 1,
            outbox: Vec::new(),
            revoke_next: HashSet::new(),
        }
    }

    /// A random peer id for a fresh replica.
    pub fn random_peer() -> PeerId {
        uuid::Uuid::new_v4().as_u64_pair().0
    }

    pub fn peer_id(&self) -> PeerId {
        self.clock.peer()
    }

    /// Issue a stamp for a local write.
    pub fn tick(&mut self) -> Stamp {
        self.clock.tick()
    }

    /// Wall-clock milliseconds from the document's clock source.
    pub fn now_millis(&self) -> i64 {
        self.clock.wall_millis()
    }

    pub fn state(&self) -> &DocState {
        &self.state
    }

    // --- Writes ---

    /// Write fields of an entity with a fresh stamp.
    pub fn put(&mut self, key: EntityKey, fields: FieldValues) -> Result<Stamp, DocError> {
        let stamp = self.tick();
        self.put_stamped(key, fields, stamp)?;
        Ok(stamp)
    }

    /// Write fields of an entity with a stamp issued earlier by [`tick`].
    ///
    /// [`tick`]: SharedDocument::tick
    pub fn put_stamped(&mut self, key: EntityKey, fields: FieldValues, stamp: Stamp) -> Result<(), DocError> {
        if fields.is_empty() {
            return Err(DocError::EmptyWrite { key: key.to_string() });
        }
        self.clock.observe(&stamp);
        let delta = EntityDelta {
            collection: key.collection,
            id: key.id,
            fields: fields
                .into_iter()
                .map(|(field, value)| (field, FieldWrite { value, stamp }))
                .collect(),
        };
        self.outbox.push(delta.clone());
        self.merge_and_dispatch(vec![delta], ChangeOrigin::Local);
        Ok(())
    }

    /// Tombstone an entity.
    pub fn delete(&mut self, key: EntityKey) -> Result<Stamp, DocError> {
        let stamp = self.tick();
        self.delete_stamped(key, stamp)?;
        Ok(stamp)
    }

    pub fn delete_stamped(&mut self, key: EntityKey, stamp: Stamp) -> Result<(), DocError> {
        let fields = FieldValues::from([(DELETED_FIELD.to_string(), Value::Bool(true))]);
        self.put_stamped(key, fields, stamp)
    }

    // --- Replication ---

    /// Merge a batch received from another replica. Returns how many
    /// entities changed.
    pub fn apply_remote(&mut self, batch: &UpdateBatch) -> usize {
        for delta in &batch.entries {
            for write in delta.fields.values() {
                self.clock.observe(&write.stamp);
            }
        }
        self.merge_and_dispatch(batch.entries.clone(), ChangeOrigin::Remote(batch.origin))
    }

    /// Decode and merge an encoded batch.
    pub fn import(&mut self, bytes: &[u8]) -> Result<usize, DocError> {
        let batch = UpdateBatch::from_bytes(bytes)?;
        Ok(self.apply_remote(&batch))
    }

    /// Drain local writes not yet sent to peers.
    pub fn take_pending(&mut self) -> Option<UpdateBatch> {
        if self.outbox.is_empty() {
            return None;
        }
        Some(UpdateBatch {
            origin: self.peer_id(),
            entries: std::mem::take(&mut self.outbox),
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Full state as one batch.
    pub fn export_snapshot(&self) -> UpdateBatch {
        self.state.to_batch(self.peer_id())
    }

    pub fn export_bytes(&self) -> Result<Vec<u8>, DocError> {
        self.export_snapshot().to_bytes()
    }

    /// Stable, detached read of an entity outside any update cycle.
    pub fn read(&self, key: &EntityKey) -> Option<EntitySnapshot> {
        self.state.snapshot(key)
    }

    // --- Observation ---

    /// Register a callback for every batch of changes.
    pub fn observe(&mut self, callback: impl FnMut(&ChangeBatch) + 'static) -> ObserverId {
        let id = self.next_observer;
        self.next_observer += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn is_observing(&self, id: ObserverId) -> bool {
        self.observers.iter().any(|(observer_id, _)| *observer_id == id)
    }

    /// Hand out the handle for `key` already revoked in the next batch that
    /// contains it, the way handles look when their cycle was torn down
    /// between notification and access.
    pub fn inject_revocation(&mut self, key: EntityKey) {
        self.revoke_next.insert(key);
    }

    fn merge_and_dispatch(&mut self, deltas: Vec<EntityDelta>, origin: ChangeOrigin) -> usize {
        let mut seen = HashSet::new();
        let mut changes = Vec::new();
        for delta in &deltas {
            let key = delta.key();
            let before = self.state.snapshot(&key);
            if self.state.merge_delta(delta) && seen.insert(key.clone()) {
                changes.push((key, before));
            }
        }
        let changed = changes.len();
        self.dispatch(origin, changes);
        changed
    }

    fn dispatch(&mut self, origin: ChangeOrigin, changes: Vec<(EntityKey, Option<EntitySnapshot>)>) {
        if changes.is_empty() || self.observers.is_empty() {
            return;
        }

        let cycle = UpdateCycle::begin();
        let records = changes
            .into_iter()
            .filter_map(|(key, before)| {
                let after = self.state.snapshot(&key)?;
                let kind = if after.is_deleted() {
                    ChangeKind::Deleted
                } else if before.is_none() {
                    ChangeKind::Added
                } else {
                    ChangeKind::Updated
                };
                let revoked = self.revoke_next.remove(&key);
                Some(ChangeRecord {
                    kind,
                    key,
                    before,
                    after: cycle.handle(after, revoked),
                })
            })
            .collect();
        let batch = ChangeBatch { origin, records };

        let mut observers = std::mem::take(&mut self.observers);
        observers.retain_mut(|(id, observer)| {
            match panic::catch_unwind(AssertUnwindSafe(|| observer(&batch))) {
                Ok(()) => true,
                Err(_) => {
                    log::error!("Observer {} panicked during change delivery, detaching it", id);
                    false
                }
            }
        });
        self.observers = observers;
        cycle.end();
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("clock", &self.clock)
            .field("observers", &self.observers.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{EntityHandle, ManualClock};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn doc(peer: PeerId, start: i64) -> (SharedDocument, ManualClock) {
        let clock = ManualClock::new(start);
        (SharedDocument::with_clock(peer, Box::new(clock.clone())), clock)
    }

    fn fields(pairs: &[(&str, Value)]) -> FieldValues {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_put_notifies_observer_with_record() {
        let (mut doc, _) = doc(1, 100);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        doc.observe(move |batch| {
            for record in &batch.records {
                let content = record.after.read().unwrap().get("content").cloned();
                sink.borrow_mut().push((record.kind, record.key.clone(), content));
            }
        });

        doc.put(EntityKey::node("n1"), fields(&[("content", json!("hello"))])).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, ChangeKind::Added);
        assert_eq!(seen[0].1, EntityKey::node("n1"));
        assert_eq!(seen[0].2, Some(json!("hello")));
    }

    #[test]
    fn test_handles_revoked_after_delivery() {
        let (mut doc, _) = doc(1, 100);
        let kept: Rc<RefCell<Vec<EntityHandle>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&kept);
        doc.observe(move |batch| {
            sink.borrow_mut().extend(batch.records.iter().map(|r| r.after.clone()));
        });

        doc.put(EntityKey::node("n1"), fields(&[("x", json!(1.0))])).unwrap();

        let kept = kept.borrow();
        assert_eq!(kept.len(), 1);
        assert!(matches!(kept[0].read(), Err(DocError::RevokedHandle { .. })));
    }

    #[test]
    fn test_delete_reports_deleted_kind() {
        let (mut doc, _) = doc(1, 100);
        doc.put(EntityKey::node("n1"), fields(&[("x", json!(1.0))])).unwrap();

        let kinds = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&kinds);
        doc.observe(move |batch| {
            sink.borrow_mut().extend(batch.records.iter().map(|r| (r.kind, r.before.is_some())));
        });
        doc.delete(EntityKey::node("n1")).unwrap();

        assert_eq!(*kinds.borrow(), vec![(ChangeKind::Deleted, true)]);
        assert!(doc.read(&EntityKey::node("n1")).unwrap().is_deleted());
    }

    #[test]
    fn test_panicking_observer_is_detached() {
        let (mut doc, _) = doc(1, 100);
        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);
        let bad = doc.observe(|_| panic!("observer failure"));
        let good = doc.observe(move |_| *counter.borrow_mut() += 1);

        doc.put(EntityKey::node("n1"), fields(&[("x", json!(1.0))])).unwrap();
        doc.put(EntityKey::node("n2"), fields(&[("x", json!(2.0))])).unwrap();

        assert!(!doc.is_observing(bad));
        assert!(doc.is_observing(good));
        assert_eq!(*calls.borrow(), 2);
    }

    #[test]
    fn test_injected_revocation_hits_only_that_entity() {
        let (mut a, _) = doc(1, 100);
        a.put(EntityKey::node("n1"), fields(&[("x", json!(1.0))])).unwrap();
        a.put(EntityKey::node("n2"), fields(&[("x", json!(2.0))])).unwrap();
        let batch = a.take_pending().unwrap();

        let (mut b, _) = doc(2, 50);
        b.inject_revocation(EntityKey::node("n2"));
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&results);
        b.observe(move |batch| {
            for record in &batch.records {
                sink.borrow_mut().push((record.key.id.clone(), record.after.read().is_ok()));
            }
        });
        b.apply_remote(&batch);

        assert_eq!(
            *results.borrow(),
            vec![("n1".to_string(), true), ("n2".to_string(), false)]
        );
    }

    #[test]
    fn test_empty_write_rejected() {
        let (mut doc, _) = doc(1, 100);
        assert!(matches!(
            doc.put(EntityKey::node("n1"), FieldValues::new()),
            Err(DocError::EmptyWrite { .. })
        ));
    }

    #[test]
    fn test_outbox_drains_once() {
        let (mut doc, _) = doc(1, 100);
        doc.put(EntityKey::node("n1"), fields(&[("x", json!(1.0))])).unwrap();
        let batch = doc.take_pending().unwrap();
        assert_eq!(batch.origin, 1);
        assert_eq!(batch.entries.len(), 1);
        assert!(doc.take_pending().is_none());
    }

    #[test]
    fn test_remote_echo_is_silent() {
        let (mut doc, _) = doc(1, 100);
        doc.put(EntityKey::node("n1"), fields(&[("x", json!(1.0))])).unwrap();
        let echo = doc.take_pending().unwrap();

        let notified = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&notified);
        doc.observe(move |_| *counter.borrow_mut() += 1);
        assert_eq!(doc.apply_remote(&echo), 0);
        assert_eq!(*notified.borrow(), 0);
    }

    #[test]
    fn test_remote_stamp_advances_local_clock() {
        let (mut a, _) = doc(1, 5_000);
        a.put(EntityKey::node("n1"), fields(&[("content", json!("a"))])).unwrap();
        let batch = a.take_pending().unwrap();

        // Replica with a lagging clock still writes after what it has seen.
        let (mut b, _) = doc(2, 1_000);
        b.apply_remote(&batch);
        b.put(EntityKey::node("n1"), fields(&[("content", json!("b"))])).unwrap();
        assert_eq!(
            b.read(&EntityKey::node("n1")).unwrap().get("content"),
            Some(&json!("b"))
        );
    }
}
