//! Dialect-neutral representation of a single captured row change or DDL
//! statement, plus the typed column-value sum type both capture variants
//! decode into.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid DML change: {0}")]
    InvalidDml(String),
    #[error("failed to decode change: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Which primary engine a change, capture session, or buffer state came
/// from. Mirrors the teacher's own `SrcType`, extended with the engines
/// this pipeline actually targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Postgres,
    MySql,
}

/// A typed column value. Internally tagged so `Null` serializes distinctly
/// from an empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    /// RFC3339-formatted timestamp, kept as text end to end so capture,
    /// transform, and the SQL emitter never disagree on precision.
    Timestamp(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::String(s) | ColumnValue::Timestamp(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Int64(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Float64(value)
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Bool(value)
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::String(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::String(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

/// Pre-image primary-key columns of a row, required to locate it on the
/// replica for update/delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValues {
    pub key_names: Vec<String>,
    pub key_values: Vec<ColumnValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmlChange {
    pub table: String,
    pub kind: DmlKind,
    pub column_names: Vec<String>,
    pub column_values: Vec<ColumnValue>,
    pub old_keys: Option<KeyValues>,
}

impl DmlChange {
    /// Enforces the shape invariants spec'd for DML changes: insert forbids
    /// `old_keys`, update/delete require it, and column name/value counts
    /// must match.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.column_names.len() != self.column_values.len() {
            return Err(ModelError::InvalidDml(format!(
                "column_names has {} entries but column_values has {} for table {}",
                self.column_names.len(),
                self.column_values.len(),
                self.table
            )));
        }
        match self.kind {
            DmlKind::Insert => {
                if self.old_keys.is_some() {
                    return Err(ModelError::InvalidDml(format!(
                        "insert on {} must not carry old_keys",
                        self.table
                    )));
                }
            }
            DmlKind::Update | DmlKind::Delete => {
                let keys = self.old_keys.as_ref().ok_or_else(|| {
                    ModelError::InvalidDml(format!(
                        "{:?} on {} requires old_keys",
                        self.kind, self.table
                    ))
                })?;
                if keys.key_names.is_empty() {
                    return Err(ModelError::InvalidDml(format!(
                        "{:?} on {} has empty old_keys",
                        self.kind, self.table
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlChange {
    pub id: Option<i64>,
    /// Server-side event timestamp (MySQL) or DDL-capture-trigger
    /// timestamp (PG), RFC3339.
    pub time: String,
    pub username: Option<String>,
    pub database: String,
    pub ddl: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Dml(DmlChange),
    Ddl(DdlChange),
}

/// `{position, type, data}` on the wire — `type`/`data` come from the
/// adjacently-tagged `Payload` flattened alongside `position`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub position: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Change {
    pub fn new(position: impl Into<String>, payload: Payload) -> Self {
        Self {
            position: position.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_dml() -> DmlChange {
        DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["id".to_string(), "name".to_string()],
            column_values: vec![ColumnValue::Int64(1), ColumnValue::String("O'Brien".to_string())],
            old_keys: None,
        }
    }

    #[test]
    fn round_trips_through_json() {
        let change = Change::new("0/100", Payload::Dml(sample_dml()));
        let encoded = change.encode().unwrap();
        let decoded = Change::decode(&encoded).unwrap();
        assert_eq!(change, decoded);
        let re_encoded = decoded.encode().unwrap();
        assert_eq!(encoded, re_encoded);
    }

    #[test]
    fn null_serializes_distinctly_from_empty_string() {
        let null = serde_json::to_string(&ColumnValue::Null).unwrap();
        let empty = serde_json::to_string(&ColumnValue::String(String::new())).unwrap();
        assert_ne!(null, empty);
    }

    #[test]
    fn insert_with_old_keys_is_invalid() {
        let mut dml = sample_dml();
        dml.old_keys = Some(KeyValues {
            key_names: vec!["id".to_string()],
            key_values: vec![ColumnValue::Int64(1)],
        });
        assert!(dml.validate().is_err());
    }

    #[test]
    fn update_without_old_keys_is_invalid() {
        let mut dml = sample_dml();
        dml.kind = DmlKind::Update;
        assert!(dml.validate().is_err());
    }

    #[test]
    fn mismatched_column_counts_are_invalid() {
        let mut dml = sample_dml();
        dml.column_names.push("extra".to_string());
        assert!(dml.validate().is_err());
    }

    proptest::proptest! {
        #[test]
        fn column_value_round_trips(s in ".*", n in proptest::option::of(any::<i64>())) {
            let value = match n {
                Some(n) => ColumnValue::Int64(n),
                None => ColumnValue::String(s),
            };
            let encoded = serde_json::to_vec(&value).unwrap();
            let decoded: ColumnValue = serde_json::from_slice(&encoded).unwrap();
            proptest::prop_assert_eq!(value, decoded);
        }
    }
}
