//! Document schema: collections of entities made of LWW field registers.

use super::DocError;
use super::clock::{PeerId, Stamp};
use crdts::LWWReg;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Key for the nodes collection in the document.
pub const NODES_KEY: &str = "nodes";
/// Key for the connections collection in the document.
pub const CONNECTIONS_KEY: &str = "connections";
/// Key for the bindings collection in the document.
pub const BINDINGS_KEY: &str = "bindings";
/// Key for the per-user viewport collection in the document.
pub const VIEWPORTS_KEY: &str = "viewports";
/// Tombstone field written by a delete.
pub const DELETED_FIELD: &str = "_deleted";

/// Top-level collection of the document.
///
/// Ordered so that nodes project before the connections that reference
/// them, and connections before their bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Nodes,
    Connections,
    Bindings,
    Viewports,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Nodes,
        Collection::Connections,
        Collection::Bindings,
        Collection::Viewports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Nodes => NODES_KEY,
            Collection::Connections => CONNECTIONS_KEY,
            Collection::Bindings => BINDINGS_KEY,
            Collection::Viewports => VIEWPORTS_KEY,
        }
    }

    pub fn parse(s: &str) -> Result<Self, DocError> {
        match s {
            NODES_KEY => Ok(Collection::Nodes),
            CONNECTIONS_KEY => Ok(Collection::Connections),
            BINDINGS_KEY => Ok(Collection::Bindings),
            VIEWPORTS_KEY => Ok(Collection::Viewports),
            other => Err(DocError::UnknownCollection(other.to_string())),
        }
    }
}

/// Address of one entity in the document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub collection: Collection,
    pub id: String,
}

impl EntityKey {
    pub fn new(collection: Collection, id: impl ToString) -> Self {
        Self {
            collection,
            id: id.to_string(),
        }
    }

    pub fn node(id: impl ToString) -> Self {
        Self::new(Collection::Nodes, id)
    }

    pub fn connection(id: impl ToString) -> Self {
        Self::new(Collection::Connections, id)
    }

    pub fn binding(id: impl ToString) -> Self {
        Self::new(Collection::Bindings, id)
    }

    pub fn viewport(owner: impl ToString) -> Self {
        Self::new(Collection::Viewports, owner)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection.as_str(), self.id)
    }
}

/// Plain field values, as handed to `put`.
pub type FieldValues = BTreeMap<String, Value>;

/// A field value together with the stamp it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub value: Value,
    pub stamp: Stamp,
}

/// Stored state of one entity: a register per field.
#[derive(Debug, Clone, Default)]
pub struct EntityRecord {
    fields: BTreeMap<String, LWWReg<Value, Stamp>>,
}

impl EntityRecord {
    /// Merge one field write. Returns true if the stored value changed.
    pub fn merge_write(&mut self, field: &str, write: &FieldWrite) -> bool {
        match self.fields.get_mut(field) {
            Some(reg) => {
                let before = reg.marker;
                reg.update(write.value.clone(), write.stamp);
                reg.marker != before
            }
            None => {
                self.fields.insert(
                    field.to_string(),
                    LWWReg {
                        val: write.value.clone(),
                        marker: write.stamp,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|reg| &reg.val)
    }

    pub fn stamp(&self, field: &str) -> Option<Stamp> {
        self.fields.get(field).map(|reg| reg.marker)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.get(DELETED_FIELD), Some(Value::Bool(true)))
    }

    pub fn values(&self) -> FieldValues {
        self.fields
            .iter()
            .map(|(k, reg)| (k.clone(), reg.val.clone()))
            .collect()
    }

    pub fn writes(&self) -> BTreeMap<String, FieldWrite> {
        self.fields
            .iter()
            .map(|(k, reg)| {
                (
                    k.clone(),
                    FieldWrite {
                        value: reg.val.clone(),
                        stamp: reg.marker,
                    },
                )
            })
            .collect()
    }
}

/// Detached copy of an entity's fields and stamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub key: EntityKey,
    pub fields: BTreeMap<String, FieldWrite>,
}

impl EntitySnapshot {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|w| &w.value)
    }

    pub fn stamp(&self, field: &str) -> Option<Stamp> {
        self.fields.get(field).map(|w| w.stamp)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.get(DELETED_FIELD), Some(Value::Bool(true)))
    }
}

/// Field writes for one entity, as exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub collection: Collection,
    pub id: String,
    pub fields: BTreeMap<String, FieldWrite>,
}

impl EntityDelta {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.collection, &self.id)
    }
}

/// A set of entity deltas from one replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub origin: PeerId,
    pub entries: Vec<EntityDelta>,
}

impl UpdateBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DocError> {
        serde_json::to_vec(self).map_err(|e| DocError::Decode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocError> {
        serde_json::from_slice(bytes).map_err(|e| DocError::Decode(e.to_string()))
    }
}

/// Pure replicated state: collection -> id -> record.
///
/// Merging is commutative, associative and idempotent, so two states that
/// have merged the same deltas in any order are equal.
#[derive(Debug, Clone, Default)]
pub struct DocState {
    collections: BTreeMap<Collection, BTreeMap<String, EntityRecord>>,
}

impl DocState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one delta. Returns true if any field changed.
    pub fn merge_delta(&mut self, delta: &EntityDelta) -> bool {
        let record = self
            .collections
            .entry(delta.collection)
            .or_default()
            .entry(delta.id.clone())
            .or_default();
        let mut changed = false;
        for (field, write) in &delta.fields {
            changed |= record.merge_write(field, write);
        }
        changed
    }

    /// Merge every delta of a batch. Returns how many entities changed.
    pub fn merge_batch(&mut self, batch: &UpdateBatch) -> usize {
        batch
            .entries
            .iter()
            .filter(|delta| self.merge_delta(delta))
            .count()
    }

    pub fn entity(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.collections.get(&key.collection)?.get(&key.id)
    }

    pub fn snapshot(&self, key: &EntityKey) -> Option<EntitySnapshot> {
        self.entity(key).map(|record| EntitySnapshot {
            key: key.clone(),
            fields: record.writes(),
        })
    }

    pub fn keys(&self, collection: Collection) -> Vec<EntityKey> {
        self.collections
            .get(&collection)
            .map(|entities| entities.keys().map(|id| EntityKey::new(collection, id)).collect())
            .unwrap_or_default()
    }

    /// Number of entities in a collection that are not tombstoned.
    pub fn live_count(&self, collection: Collection) -> usize {
        self.collections
            .get(&collection)
            .map(|entities| entities.values().filter(|r| !r.is_deleted()).count())
            .unwrap_or(0)
    }

    /// Everything as one batch, for initial sync of a new replica.
    pub fn to_batch(&self, origin: PeerId) -> UpdateBatch {
        let entries = self
            .collections
            .iter()
            .flat_map(|(collection, entities)| {
                entities.iter().map(move |(id, record)| EntityDelta {
                    collection: *collection,
                    id: id.clone(),
                    fields: record.writes(),
                })
            })
            .collect();
        UpdateBatch { origin, entries }
    }

    /// Plain values of every entity, for comparing replicas.
    pub fn materialize(&self) -> BTreeMap<EntityKey, FieldValues> {
        self.collections
            .iter()
            .flat_map(|(collection, entities)| {
                entities
                    .iter()
                    .map(move |(id, record)| (EntityKey::new(*collection, id), record.values()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(value: Value, time: i64, peer: PeerId) -> FieldWrite {
        FieldWrite {
            value,
            stamp: Stamp { time, counter: 0, peer },
        }
    }

    fn delta(id: &str, field: &str, w: FieldWrite) -> EntityDelta {
        EntityDelta {
            collection: Collection::Nodes,
            id: id.to_string(),
            fields: BTreeMap::from([(field.to_string(), w)]),
        }
    }

    #[test]
    fn test_later_stamp_wins_regardless_of_order() {
        let early = delta("n1", "content", write(json!("early"), 1000, 1));
        let late = delta("n1", "content", write(json!("late"), 2000, 2));

        let mut a = DocState::new();
        a.merge_delta(&early);
        a.merge_delta(&late);

        let mut b = DocState::new();
        b.merge_delta(&late);
        b.merge_delta(&early);

        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.entity(&EntityKey::node("n1")).unwrap().get("content"), Some(&json!("late")));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let d = delta("n1", "x", write(json!(5.0), 10, 1));
        let mut state = DocState::new();
        assert!(state.merge_delta(&d));
        assert!(!state.merge_delta(&d));
    }

    #[test]
    fn test_tombstone_detection() {
        let mut state = DocState::new();
        state.merge_delta(&delta("n1", "x", write(json!(1.0), 1, 1)));
        assert_eq!(state.live_count(Collection::Nodes), 1);

        state.merge_delta(&delta("n1", DELETED_FIELD, write(json!(true), 2, 1)));
        assert!(state.entity(&EntityKey::node("n1")).unwrap().is_deleted());
        assert_eq!(state.live_count(Collection::Nodes), 0);
    }

    #[test]
    fn test_batch_bytes_roundtrip() {
        let mut state = DocState::new();
        state.merge_delta(&delta("n1", "x", write(json!(1.0), 1, 1)));
        let batch = state.to_batch(7);
        let decoded = UpdateBatch::from_bytes(&batch.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, batch);
        assert!(UpdateBatch::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_collection_order_projects_nodes_first() {
        assert!(Collection::Nodes < Collection::Connections);
        assert!(Collection::Connections < Collection::Bindings);
        assert!(matches!(Collection::parse("widgets"), Err(DocError::UnknownCollection(_))));
    }
}
