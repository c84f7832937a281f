//! Schemaless field values.
//!
//! Custom fields and entity snapshots are stored as an explicit
//! key-to-value map. Values are restricted to scalars; anything else is
//! rejected at the boundary by [`FieldValue::from_json`].

use crate::error::ValueError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A scalar field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Any JSON number, stored as f64.
    Number(f64),
    /// UTF-8 string.
    String(String),
}

impl FieldValue {
    /// Validate a JSON value coming from outside the engine.
    ///
    /// Arrays and objects are rejected; numbers that cannot be represented
    /// as f64 are rejected.
    pub fn from_json(key: &str, value: &serde_json::Value) -> Result<Self, ValueError> {
        match value {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                n.as_f64()
                    .map(Self::Number)
                    .ok_or_else(|| ValueError::InvalidValue {
                        field: key.to_string(),
                        reason: "number out of range".into(),
                    })
            }
            serde_json::Value::String(s) => Ok(Self::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Err(ValueError::InvalidValue {
                    field: key.to_string(),
                    reason: "only scalar values are allowed".into(),
                })
            }
        }
    }

    /// Returns the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true for [`FieldValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// Ordered field map. Used for snapshots, edits and custom fields.
pub type Fields = BTreeMap<String, FieldValue>;

/// Validate a JSON object into a [`Fields`] map.
pub fn fields_from_json(value: &serde_json::Value) -> Result<Fields, ValueError> {
    let object = value.as_object().ok_or(ValueError::NotAnObject)?;
    object
        .iter()
        .map(|(k, v)| FieldValue::from_json(k, v).map(|fv| (k.clone(), fv)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_are_accepted() {
        let fields = fields_from_json(&json!({
            "tier": "gold",
            "score": 4.5,
            "active": true,
            "notes": null,
        }))
        .unwrap();

        assert_eq!(fields["tier"], FieldValue::from("gold"));
        assert_eq!(fields["score"], FieldValue::Number(4.5));
        assert_eq!(fields["active"], FieldValue::Bool(true));
        assert!(fields["notes"].is_null());
    }

    #[test]
    fn nested_values_are_rejected() {
        let err = fields_from_json(&json!({ "tags": ["a", "b"] })).unwrap_err();
        assert!(matches!(err, ValueError::InvalidValue { ref field, .. } if field == "tags"));

        let err = fields_from_json(&json!({ "meta": { "a": 1 } })).unwrap_err();
        assert!(matches!(err, ValueError::InvalidValue { .. }));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            fields_from_json(&json!("x")),
            Err(ValueError::NotAnObject)
        ));
    }

    #[test]
    fn untagged_serde_keeps_plain_json_shape() {
        let mut fields = Fields::new();
        fields.insert("a".into(), FieldValue::from("x"));
        fields.insert("b".into(), FieldValue::Null);
        let text = serde_json::to_string(&fields).unwrap();
        assert_eq!(text, r#"{"a":"x","b":null}"#);

        let back: Fields = serde_json::from_str(&text).unwrap();
        assert_eq!(back, fields);
    }
}
