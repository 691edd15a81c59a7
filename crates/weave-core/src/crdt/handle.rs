//! Change notifications and the revocable handles they carry.

use super::DocError;
use super::clock::PeerId;
use super::schema::{EntityKey, EntitySnapshot};
use std::cell::Cell;
use std::rc::Rc;

/// Handle to a changed entity, valid only while the update cycle that
/// delivered it is running.
///
/// Observers must copy what they need out of the handle before returning.
/// Reading it afterwards fails with [`DocError::RevokedHandle`].
#[derive(Debug, Clone)]
pub struct EntityHandle {
    key: EntityKey,
    data: Rc<EntitySnapshot>,
    cycle: Rc<Cell<bool>>,
    revoked: bool,
}

impl EntityHandle {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn is_valid(&self) -> bool {
        !self.revoked && self.cycle.get()
    }

    /// Borrow the entity's fields.
    pub fn read(&self) -> Result<&EntitySnapshot, DocError> {
        if self.is_valid() {
            Ok(&self.data)
        } else {
            Err(DocError::RevokedHandle {
                key: self.key.to_string(),
            })
        }
    }
}

/// Lifetime of one delivery of a change batch.
#[derive(Debug)]
pub(crate) struct UpdateCycle {
    live: Rc<Cell<bool>>,
}

impl UpdateCycle {
    pub(crate) fn begin() -> Self {
        Self {
            live: Rc::new(Cell::new(true)),
        }
    }

    pub(crate) fn handle(&self, snapshot: EntitySnapshot, revoked: bool) -> EntityHandle {
        EntityHandle {
            key: snapshot.key.clone(),
            data: Rc::new(snapshot),
            cycle: Rc::clone(&self.live),
            revoked,
        }
    }

    /// Revoke every handle issued in this cycle.
    pub(crate) fn end(self) {
        self.live.set(false);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Where a batch of changes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote(PeerId),
}

/// One `{type, key, before, after}` change message.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub key: EntityKey,
    /// Detached copy of the entity before the change, if it existed.
    pub before: Option<EntitySnapshot>,
    pub after: EntityHandle,
}

#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub origin: ChangeOrigin,
    pub records: Vec<ChangeRecord>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot() -> EntitySnapshot {
        EntitySnapshot {
            key: EntityKey::node("n1"),
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_handle_valid_during_cycle() {
        let cycle = UpdateCycle::begin();
        let handle = cycle.handle(snapshot(), false);
        assert!(handle.read().is_ok());
        cycle.end();
    }

    #[test]
    fn test_handle_revoked_after_cycle_ends() {
        let cycle = UpdateCycle::begin();
        let handle = cycle.handle(snapshot(), false);
        let kept = handle.clone();
        cycle.end();

        assert!(!kept.is_valid());
        match kept.read() {
            Err(DocError::RevokedHandle { key }) => assert_eq!(key, "nodes/n1"),
            other => panic!("expected revoked handle, got {:?}", other),
        }
    }

    #[test]
    fn test_handle_revoked_up_front() {
        let cycle = UpdateCycle::begin();
        let handle = cycle.handle(snapshot(), true);
        assert!(handle.read().is_err());
        cycle.end();
    }
}
