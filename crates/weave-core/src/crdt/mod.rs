//! Replicated document for collaborative editing.
//!
//! # Schema
//!
//! ```text
//! SharedDocument
//! ├── "nodes":       id -> { x, y, w, h, kind, content, style, z_index, created_*, updated_*, _deleted }
//! ├── "connections": id -> { start_node_id, end_node_id, start_anchor, end_anchor, type, style, z_index, _deleted }
//! ├── "bindings":    id -> { connection_id, node_id, terminal, anchor_side, offset_x, offset_y, _deleted }
//! └── "viewports":   user id -> { offset_x, offset_y, scale, updated_at }
//! ```
//!
//! Each field is an LWW register stamped by a hybrid logical clock, so
//! replicas converge whatever order writes arrive in. Deletes write the
//! `_deleted` tombstone field; nothing is ever physically removed.

mod clock;
mod convert;
mod document;
mod handle;
mod schema;

pub use clock::{ClockSource, HybridClock, ManualClock, PeerId, Stamp, SystemClock};
pub use convert::{FieldCodec, decode_snapshot, fields_to_values};
pub use document::{ObserverId, SharedDocument};
pub use handle::{ChangeBatch, ChangeKind, ChangeOrigin, ChangeRecord, EntityHandle};
pub use schema::{
    BINDINGS_KEY, CONNECTIONS_KEY, Collection, DELETED_FIELD, DocState, EntityDelta, EntityKey, EntityRecord,
    EntitySnapshot, FieldValues, FieldWrite, NODES_KEY, UpdateBatch, VIEWPORTS_KEY,
};

use thiserror::Error;

/// Document errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DocError {
    #[error("Handle to {key} was revoked")]
    RevokedHandle { key: String },
    #[error("Write to {key} has no fields")]
    EmptyWrite { key: String },
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Decode error: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// One write a replica might make: (entity, field, value, time, peer).
    fn op_strategy() -> impl Strategy<Value = (u8, u8, i32, i64, u64)> {
        (0u8..4, 0u8..3, any::<i32>(), 0i64..50, 1u64..4)
    }

    fn to_delta((entity, field, value, time, peer): (u8, u8, i32, i64, u64)) -> UpdateBatch {
        let field_name = ["x", "content", DELETED_FIELD][field as usize];
        let value = match field {
            0 => json!(value as f64),
            1 => json!(format!("v{}", value)),
            _ => json!(value % 2 == 0),
        };
        UpdateBatch {
            origin: peer,
            entries: vec![EntityDelta {
                collection: Collection::Nodes,
                id: format!("n{}", entity),
                fields: [(
                    field_name.to_string(),
                    FieldWrite {
                        value,
                        // Counter keeps stamps unique per (time, peer).
                        stamp: Stamp { time, counter: value_counter(entity, field), peer },
                    },
                )]
                .into_iter()
                .collect(),
            }],
        }
    }

    fn value_counter(entity: u8, field: u8) -> u32 {
        u32::from(entity) * 8 + u32::from(field)
    }

    proptest! {
        #[test]
        fn prop_replicas_converge_in_any_order(
            ops in prop::collection::vec(op_strategy(), 1..40),
            seed in any::<u64>(),
        ) {
            // Stamps must be unique per write; keep the first op per stamp.
            let mut seen = std::collections::HashSet::new();
            let batches: Vec<UpdateBatch> = ops
                .into_iter()
                .filter(|(e, f, _, t, p)| seen.insert((*t, value_counter(*e, *f), *p)))
                .map(to_delta)
                .collect();

            let mut shuffled = batches.clone();
            // Deterministic Fisher-Yates from the seed.
            let mut state = seed | 1;
            for i in (1..shuffled.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let j = (state % (i as u64 + 1)) as usize;
                shuffled.swap(i, j);
            }

            let mut a = SharedDocument::with_clock(10, Box::new(ManualClock::new(0)));
            let mut b = SharedDocument::with_clock(11, Box::new(ManualClock::new(0)));
            for batch in &batches {
                a.apply_remote(batch);
            }
            for batch in shuffled.iter().rev() {
                b.apply_remote(batch);
            }
            // Replaying everything again changes nothing.
            for batch in &shuffled {
                b.apply_remote(batch);
            }

            prop_assert_eq!(a.state().materialize(), b.state().materialize());
        }
    }
}
