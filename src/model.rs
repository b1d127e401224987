use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// A stored document: a JSON object keyed by field name. The `id` field is
/// reserved and managed by the store.
pub type Document = Map<String, Value>;

/// A tagged reference to another entity, `{type:"REF", entity, id}` on the
/// wire. A reference held in a top-level document field is an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub entity: String,
    pub id: i64,
}

impl Reference {
    pub fn node_id(&self) -> String {
        node_id(&self.entity, self.id)
    }
}

/// Composite node identifier, `"<entity>:<id>"`.
pub fn node_id(entity: &str, id: i64) -> String {
    format!("{entity}:{id}")
}

/// Splits a node identifier back into its entity name and id. Entity names
/// cannot contain `:`, so the first colon is the separator.
pub fn parse_node_id(node: &str) -> Result<(String, i64)> {
    let (entity, id) = node
        .split_once(':')
        .ok_or_else(|| StoreError::InvalidInput(format!("malformed node id {node:?}")))?;
    let id = id
        .parse::<i64>()
        .map_err(|_| StoreError::InvalidInput(format!("malformed node id {node:?}")))?;
    Ok((entity.to_string(), id))
}

/// The single reference-detection predicate, shared by graph sync, embedding
/// and the integrity audit. A value is a reference iff it is an object with
/// `type == "REF"`, a non-empty string `entity` and an integer `id >= 1`.
/// Integer-valued floats are accepted; additional keys are ignored.
pub fn as_reference(value: &Value) -> Option<Reference> {
    let obj = value.as_object()?;
    if obj.get("type")?.as_str()? != "REF" {
        return None;
    }
    let entity = obj.get("entity")?.as_str()?;
    if entity.is_empty() {
        return None;
    }
    let id = integer_value(obj.get("id")?)?;
    if id < 1 {
        return None;
    }
    Some(Reference {
        entity: entity.to_string(),
        id,
    })
}

fn integer_value(value: &Value) -> Option<i64> {
    if let Some(id) = value.as_i64() {
        return Some(id);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Top-level reference fields of a document, as `(field, reference)` pairs in
/// field order. This is the expected edge set of the document's node.
pub fn extract_references(doc: &Document) -> Vec<(String, Reference)> {
    doc.iter()
        .filter_map(|(field, value)| as_reference(value).map(|r| (field.clone(), r)))
        .collect()
}

/// Entity names must match `[A-Za-z][A-Za-z0-9_]*`.
pub fn validate_entity_name(entity: &str) -> Result<()> {
    let mut chars = entity.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidInput(format!(
            "invalid entity name {entity:?}: must start with a letter and contain only letters, digits and underscores"
        )))
    }
}

pub fn validate_id(id: i64) -> Result<()> {
    if id >= 1 {
        Ok(())
    } else {
        Err(StoreError::InvalidInput(format!("invalid id {id}: ids start at 1")))
    }
}
