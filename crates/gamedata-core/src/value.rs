//! Cell values: the raw form a provider hands over and the typed form a
//! constructed record holds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Marker game-data tables use for an empty cell.
pub const NULL_MARKER: &str = "****";

/// One raw row: column name -> value, as supplied by a provider.
pub type RawRow = BTreeMap<String, Value>;

// ===========================================================================
// Raw values
// ===========================================================================

/// A raw cell value before any schema has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// True for `Null`, empty text and the `****` marker.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => {
                let s = s.trim();
                s.is_empty() || s == NULL_MARKER
            }
            _ => false,
        }
    }

    /// Interpret the value as an integer. Accepts decimal and `0x` hex text
    /// and floats without a fractional part.
    pub fn as_int(&self) -> Option<i64> {
        if self.is_null() {
            return None;
        }
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Value::Text(s) => parse_int(s.trim()),
            _ => None,
        }
    }

    /// Interpret the value as a float.
    pub fn as_float(&self) -> Option<f64> {
        if self.is_null() {
            return None;
        }
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Null => None,
        }
    }

    /// Render the value as text, or `None` when null.
    pub fn to_text(&self) -> Option<String> {
        if self.is_null() {
            return None;
        }
        Some(match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Null => return None,
        })
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
        }
    }
}

fn parse_int(s: &str) -> Option<i64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    s.parse::<i64>().ok()
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

// ===========================================================================
// Column types
// ===========================================================================

/// Storage type of a column in a record schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Float,
    Text,
    /// Integer reference into the string table, resolved at population time.
    StrRef,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::StrRef => "strref",
        };
        f.write_str(name)
    }
}

impl ColumnType {
    /// Coerce a raw value into this column type. Null-like values always
    /// coerce to [`FieldValue::Null`]. String references are left unresolved.
    pub fn coerce(&self, value: &Value) -> Option<FieldValue> {
        if value.is_null() {
            return Some(FieldValue::Null);
        }
        match self {
            ColumnType::Int => value.as_int().map(FieldValue::Int),
            ColumnType::Float => value.as_float().map(FieldValue::Float),
            ColumnType::Text => value.to_text().map(FieldValue::Text),
            ColumnType::StrRef => value
                .as_int()
                .and_then(|i| u32::try_from(i).ok())
                .map(|id| FieldValue::StrRef { id, text: None }),
        }
    }
}

// ===========================================================================
// Constructed values
// ===========================================================================

/// A typed cell in a constructed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    StrRef { id: u32, text: Option<String> },
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            FieldValue::StrRef { id, .. } => Some(i64::from(*id)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Text content: plain text, or the resolved text of a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::StrRef { text: Some(s), .. } => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_marker_and_empty_text_are_null() {
        assert!(Value::Null.is_null());
        assert!(Value::from("****").is_null());
        assert!(Value::from("  ").is_null());
        assert!(!Value::from("0").is_null());
        assert!(!Value::Int(0).is_null());
    }

    #[test]
    fn as_int_parses_decimal_hex_and_whole_floats() {
        assert_eq!(Value::from("42").as_int(), Some(42));
        assert_eq!(Value::from("0x1F").as_int(), Some(31));
        assert_eq!(Value::Float(3.0).as_int(), Some(3));
        assert_eq!(Value::Float(3.5).as_int(), None);
        assert_eq!(Value::from("abc").as_int(), None);
        assert_eq!(Value::from("****").as_int(), None);
    }

    #[test]
    fn coerce_respects_column_type() {
        assert_eq!(
            ColumnType::Int.coerce(&Value::from("7")),
            Some(FieldValue::Int(7))
        );
        assert_eq!(ColumnType::Int.coerce(&Value::from("seven")), None);
        assert_eq!(
            ColumnType::Float.coerce(&Value::Int(2)),
            Some(FieldValue::Float(2.0))
        );
        assert_eq!(
            ColumnType::Text.coerce(&Value::Int(2)),
            Some(FieldValue::Text("2".to_string()))
        );
        assert_eq!(
            ColumnType::StrRef.coerce(&Value::Int(112)),
            Some(FieldValue::StrRef {
                id: 112,
                text: None
            })
        );
        assert_eq!(ColumnType::StrRef.coerce(&Value::Int(-1)), None);
    }

    #[test]
    fn coerce_null_is_always_accepted() {
        for ty in [
            ColumnType::Int,
            ColumnType::Float,
            ColumnType::Text,
            ColumnType::StrRef,
        ] {
            assert_eq!(ty.coerce(&Value::from("****")), Some(FieldValue::Null));
        }
    }

    #[test]
    fn strref_as_str_uses_resolved_text() {
        let resolved = FieldValue::StrRef {
            id: 5,
            text: Some("Fighter".to_string()),
        };
        assert_eq!(resolved.as_str(), Some("Fighter"));
        assert_eq!(resolved.as_int(), Some(5));

        let unresolved = FieldValue::StrRef { id: 5, text: None };
        assert_eq!(unresolved.as_str(), None);
    }

    #[test]
    fn untagged_value_deserializes_from_json() {
        let row: RawRow = serde_json::from_str(r#"{"a": 1, "b": 2.5, "c": "x", "d": null}"#).unwrap();
        assert_eq!(row["a"], Value::Int(1));
        assert_eq!(row["b"], Value::Float(2.5));
        assert_eq!(row["c"], Value::from("x"));
        assert_eq!(row["d"], Value::Null);
    }
}
