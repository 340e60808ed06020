//! Conversion between typed payloads and document field maps.

use crate::model::entity::CollectionPayload;
use crate::store::DocumentError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Payload split into register fields and set fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    pub scalars: BTreeMap<String, Value>,
    pub sets: BTreeMap<String, BTreeSet<String>>,
}

impl FieldSet {
    /// Encodes a typed payload.
    ///
    /// # Errors
    /// - `DocumentError::Encode` when the payload is not a JSON object.
    /// - `DocumentError::InvalidSetField` when a declared set field is not a
    ///   string array.
    pub fn from_payload<P: CollectionPayload>(payload: &P) -> Result<Self, DocumentError> {
        let value = serde_json::to_value(payload)
            .map_err(|err| DocumentError::Encode(err.to_string()))?;
        Self::from_value(value, P::SET_FIELDS)
    }

    /// Splits a JSON object using the declared set-field names.
    pub fn from_value(value: Value, set_fields: &[&str]) -> Result<Self, DocumentError> {
        let Value::Object(object) = value else {
            return Err(DocumentError::Encode(
                "payload must serialize to a JSON object".to_string(),
            ));
        };

        let mut fields = Self::default();
        for (key, value) in object {
            if set_fields.contains(&key.as_str()) {
                let members = set_members(&key, value)?;
                fields.sets.insert(key, members);
            } else {
                fields.scalars.insert(key, value);
            }
        }
        Ok(fields)
    }

    /// Rebuilds the JSON object; set fields become sorted string arrays.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        for (key, value) in &self.scalars {
            object.insert(key.clone(), value.clone());
        }
        for (key, members) in &self.sets {
            object.insert(
                key.clone(),
                Value::Array(members.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(object)
    }

    /// Decodes into a typed payload.
    pub fn to_payload<P: CollectionPayload>(&self) -> Result<P, DocumentError> {
        serde_json::from_value(self.to_value()).map_err(|err| DocumentError::Decode(err.to_string()))
    }
}

fn set_members(field: &str, value: Value) -> Result<BTreeSet<String>, DocumentError> {
    match value {
        Value::Null => Ok(BTreeSet::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => Ok(text),
                _ => Err(DocumentError::InvalidSetField(field.to_string())),
            })
            .collect(),
        _ => Err(DocumentError::InvalidSetField(field.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::FieldSet;
    use crate::store::DocumentError;
    use serde_json::json;

    #[test]
    fn splits_declared_sets_from_scalars() {
        let fields = FieldSet::from_value(
            json!({"title": "a", "tags": ["x", "y", "x"], "done": false}),
            &["tags"],
        )
        .unwrap();
        assert_eq!(fields.scalars.len(), 2);
        assert_eq!(fields.sets["tags"].len(), 2);
        assert_eq!(
            fields.to_value(),
            json!({"title": "a", "tags": ["x", "y"], "done": false})
        );
    }

    #[test]
    fn rejects_non_string_set_members_and_non_objects() {
        let err = FieldSet::from_value(json!({"tags": [1]}), &["tags"]).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidSetField(field) if field == "tags"));

        let err = FieldSet::from_value(json!([1, 2]), &[]).unwrap_err();
        assert!(matches!(err, DocumentError::Encode(_)));
    }
}
