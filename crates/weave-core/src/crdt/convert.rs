//! Conversion between entity fields and document values.

use super::DocError;
use super::clock::Stamp;
use super::schema::{DELETED_FIELD, EntitySnapshot, FieldValues};
use crate::model::{
    AnchorSide, BindingField, ConnectionField, ConnectionStyle, FieldKey, NodeField, NodeKind, NodeStyle,
    RoutingType, Terminal, ViewportField,
};
use serde_json::{Value, json};
use uuid::Uuid;

/// A field that can be stored in the document and read back.
pub trait FieldCodec: FieldKey + Sized {
    fn encode(&self) -> Value;

    /// Decode a stored field. `Ok(None)` for keys this type does not know,
    /// so newer replicas can add fields without breaking older ones.
    fn decode(key: &str, value: &Value) -> Result<Option<Self>, DocError>;
}

fn invalid(key: &str, reason: &str) -> DocError {
    DocError::InvalidField {
        field: key.to_string(),
        reason: reason.to_string(),
    }
}

fn get_double(key: &str, value: &Value) -> Result<f64, DocError> {
    value.as_f64().ok_or_else(|| invalid(key, "expected number"))
}

fn get_i64(key: &str, value: &Value) -> Result<i64, DocError> {
    value.as_i64().ok_or_else(|| invalid(key, "expected integer"))
}

fn get_bool(key: &str, value: &Value) -> Result<bool, DocError> {
    value.as_bool().ok_or_else(|| invalid(key, "expected bool"))
}

fn get_string(key: &str, value: &Value) -> Result<String, DocError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(key, "expected string"))
}

fn get_uuid(key: &str, value: &Value) -> Result<Uuid, DocError> {
    let raw = get_string(key, value)?;
    Uuid::parse_str(&raw).map_err(|_| invalid(key, "expected uuid"))
}

fn get_anchor(key: &str, value: &Value) -> Result<AnchorSide, DocError> {
    let raw = get_string(key, value)?;
    AnchorSide::parse(&raw).ok_or_else(|| invalid(key, "unknown anchor side"))
}

fn get_json<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T, DocError> {
    serde_json::from_value(value.clone()).map_err(|e| invalid(key, &e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl FieldCodec for NodeField {
    fn encode(&self) -> Value {
        match self {
            NodeField::X(v) | NodeField::Y(v) | NodeField::Width(v) | NodeField::Height(v) => json!(v),
            NodeField::Kind(kind) => json!(kind.as_str()),
            NodeField::Content(s) | NodeField::CreatedBy(s) | NodeField::UpdatedBy(s) => json!(s),
            NodeField::Style(style) => to_json(style),
            NodeField::ZIndex(v) | NodeField::CreatedAt(v) | NodeField::UpdatedAt(v) => json!(v),
            NodeField::Deleted(b) => json!(b),
        }
    }

    fn decode(key: &str, value: &Value) -> Result<Option<Self>, DocError> {
        let field = match key {
            "x" => NodeField::X(get_double(key, value)?),
            "y" => NodeField::Y(get_double(key, value)?),
            "w" => NodeField::Width(get_double(key, value)?),
            "h" => NodeField::Height(get_double(key, value)?),
            "kind" => {
                let raw = get_string(key, value)?;
                NodeField::Kind(NodeKind::parse(&raw).ok_or_else(|| invalid(key, "unknown node kind"))?)
            }
            "content" => NodeField::Content(get_string(key, value)?),
            "style" => NodeField::Style(get_json::<NodeStyle>(key, value)?),
            "z_index" => NodeField::ZIndex(get_i64(key, value)?),
            "created_by" => NodeField::CreatedBy(get_string(key, value)?),
            "created_at" => NodeField::CreatedAt(get_i64(key, value)?),
            "updated_by" => NodeField::UpdatedBy(get_string(key, value)?),
            "updated_at" => NodeField::UpdatedAt(get_i64(key, value)?),
            DELETED_FIELD => NodeField::Deleted(get_bool(key, value)?),
            _ => return Ok(None),
        };
        Ok(Some(field))
    }
}

impl FieldCodec for ConnectionField {
    fn encode(&self) -> Value {
        match self {
            ConnectionField::StartNode(id) | ConnectionField::EndNode(id) => json!(id.to_string()),
            ConnectionField::StartAnchor(side) | ConnectionField::EndAnchor(side) => json!(side.as_str()),
            ConnectionField::Routing(routing) => json!(routing.as_str()),
            ConnectionField::Style(style) => to_json(style),
            ConnectionField::ZIndex(z) => json!(z),
            ConnectionField::Deleted(b) => json!(b),
        }
    }

    fn decode(key: &str, value: &Value) -> Result<Option<Self>, DocError> {
        let field = match key {
            "start_node_id" => ConnectionField::StartNode(get_uuid(key, value)?),
            "end_node_id" => ConnectionField::EndNode(get_uuid(key, value)?),
            "start_anchor" => ConnectionField::StartAnchor(get_anchor(key, value)?),
            "end_anchor" => ConnectionField::EndAnchor(get_anchor(key, value)?),
            "type" => {
                let raw = get_string(key, value)?;
                ConnectionField::Routing(RoutingType::parse(&raw).ok_or_else(|| invalid(key, "unknown routing"))?)
            }
            "style" => ConnectionField::Style(get_json::<ConnectionStyle>(key, value)?),
            "z_index" => ConnectionField::ZIndex(get_i64(key, value)?),
            DELETED_FIELD => ConnectionField::Deleted(get_bool(key, value)?),
            _ => return Ok(None),
        };
        Ok(Some(field))
    }
}

impl FieldCodec for BindingField {
    fn encode(&self) -> Value {
        match self {
            BindingField::Connection(id) | BindingField::Node(id) => json!(id.to_string()),
            BindingField::Terminal(terminal) => json!(terminal.as_str()),
            BindingField::Anchor(side) => json!(side.as_str()),
            BindingField::OffsetX(v) | BindingField::OffsetY(v) => json!(v),
            BindingField::Deleted(b) => json!(b),
        }
    }

    fn decode(key: &str, value: &Value) -> Result<Option<Self>, DocError> {
        let field = match key {
            "connection_id" => BindingField::Connection(get_uuid(key, value)?),
            "node_id" => BindingField::Node(get_uuid(key, value)?),
            "terminal" => {
                let raw = get_string(key, value)?;
                BindingField::Terminal(Terminal::parse(&raw).ok_or_else(|| invalid(key, "unknown terminal"))?)
            }
            "anchor_side" => BindingField::Anchor(get_anchor(key, value)?),
            "offset_x" => BindingField::OffsetX(get_double(key, value)?),
            "offset_y" => BindingField::OffsetY(get_double(key, value)?),
            DELETED_FIELD => BindingField::Deleted(get_bool(key, value)?),
            _ => return Ok(None),
        };
        Ok(Some(field))
    }
}

impl FieldCodec for ViewportField {
    fn encode(&self) -> Value {
        match self {
            ViewportField::OffsetX(v) | ViewportField::OffsetY(v) | ViewportField::Scale(v) => json!(v),
            ViewportField::UpdatedAt(t) => json!(t),
        }
    }

    fn decode(key: &str, value: &Value) -> Result<Option<Self>, DocError> {
        let field = match key {
            "offset_x" => ViewportField::OffsetX(get_double(key, value)?),
            "offset_y" => ViewportField::OffsetY(get_double(key, value)?),
            "scale" => ViewportField::Scale(get_double(key, value)?),
            "updated_at" => ViewportField::UpdatedAt(get_i64(key, value)?),
            _ => return Ok(None),
        };
        Ok(Some(field))
    }
}

/// Encode fields for a document write.
pub fn fields_to_values<F: FieldCodec>(fields: &[F]) -> FieldValues {
    fields
        .iter()
        .map(|field| (field.key().to_string(), field.encode()))
        .collect()
}

/// Decode every known field of a snapshot together with its stamp.
///
/// A field that fails to decode is left out and returned as an error next
/// to the fields that did decode, so one corrupt value never hides the rest
/// of the entity.
pub fn decode_snapshot<F: FieldCodec>(snapshot: &EntitySnapshot) -> (Vec<(F, Stamp)>, Vec<DocError>) {
    let mut fields = Vec::with_capacity(snapshot.fields.len());
    let mut errors = Vec::new();
    for (key, write) in &snapshot.fields {
        match F::decode(key, &write.value) {
            Ok(Some(field)) => fields.push((field, write.stamp)),
            Ok(None) => log::debug!("Ignoring unknown field {} on {}", key, snapshot.key),
            Err(e) => errors.push(e),
        }
    }
    (fields, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{EntityKey, FieldWrite};
    use crate::model::{Entity, Node};
    use kurbo::{Point, Size};
    use std::collections::BTreeMap;

    fn snapshot_of(values: FieldValues, stamp: Stamp) -> EntitySnapshot {
        EntitySnapshot {
            key: EntityKey::node("n"),
            fields: values
                .into_iter()
                .map(|(k, value)| (k, FieldWrite { value, stamp }))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_node_fields_survive_document_encoding() {
        let node = Node::new(Point::new(10.0, 20.0), Size::new(30.0, 40.0))
            .with_kind(NodeKind::Sticky)
            .with_content("todo");
        let stamp = Stamp { time: 1, counter: 0, peer: 1 };
        let snapshot = snapshot_of(fields_to_values(&node.fields()), stamp);

        let (decoded, errors) = decode_snapshot::<NodeField>(&snapshot);
        assert!(errors.is_empty());

        let mut rebuilt = Node::blank(node.id);
        for (field, _) in decoded {
            rebuilt.apply(field);
        }
        assert_eq!(rebuilt, node);
    }

    #[test]
    fn test_bad_field_does_not_hide_others() {
        let mut values = FieldValues::new();
        values.insert("x".into(), json!("not a number"));
        values.insert("y".into(), json!(5.0));
        values.insert("future_field".into(), json!(1));
        let snapshot = snapshot_of(values, Stamp::default());

        let (decoded, errors) = decode_snapshot::<NodeField>(&snapshot);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, NodeField::Y(5.0));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_unknown_anchor_is_invalid_field() {
        let result = ConnectionField::decode("start_anchor", &json!("diagonal"));
        assert!(matches!(result, Err(DocError::InvalidField { .. })));
    }
}
