//! Key schema of the target table and the key tuple derived from a record.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{FieldValue, Record};

/// Scalar type of a key attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scalar {
    String,
    Number,
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::String => write!(f, "S"),
            Scalar::Number => write!(f, "N"),
        }
    }
}

/// A named, typed key attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    pub scalar: Scalar,
}

impl KeyAttribute {
    pub fn new(name: impl Into<String>, scalar: Scalar) -> Self {
        Self {
            name: name.into(),
            scalar,
        }
    }
}

/// Primary key layout of a table.
///
/// The hash key is always present. Whether a range key exists is fixed for
/// the lifetime of the table and known before any record is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    pub hash_key: KeyAttribute,
    pub range_key: Option<KeyAttribute>,
}

impl KeySchema {
    /// Schema with only a hash key.
    pub fn simple(name: impl Into<String>, scalar: Scalar) -> Self {
        Self {
            hash_key: KeyAttribute::new(name, scalar),
            range_key: None,
        }
    }

    /// Schema with a hash key and a range key.
    pub fn composite(
        hash_name: impl Into<String>,
        hash_scalar: Scalar,
        range_name: impl Into<String>,
        range_scalar: Scalar,
    ) -> Self {
        Self {
            hash_key: KeyAttribute::new(hash_name, hash_scalar),
            range_key: Some(KeyAttribute::new(range_name, range_scalar)),
        }
    }

    /// Iterate over the key attributes, hash key first.
    pub fn attributes(&self) -> impl Iterator<Item = &KeyAttribute> {
        std::iter::once(&self.hash_key).chain(self.range_key.as_ref())
    }

    /// Extract the key tuple identifying `record` in the store.
    pub fn key_tuple(&self, record: &Record) -> KeyTuple {
        KeyTuple {
            hash: record.field(&self.hash_key.name).map(KeyValue::from_field),
            range: self
                .range_key
                .as_ref()
                .and_then(|range| record.field(&range.name))
                .map(KeyValue::from_field),
        }
    }
}

/// The value of a single key attribute, normalized for comparison.
///
/// Numbers and strings never compare equal to each other, matching the
/// store's typed keys: `1` and `"1"` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    String(String),
    Number(String),
    Other(String),
}

impl KeyValue {
    pub fn from_field(value: FieldValue<'_>) -> Self {
        match value {
            FieldValue::String(s) => KeyValue::String(s.to_string()),
            FieldValue::Number(n) => KeyValue::Number(n.to_string()),
            FieldValue::Nested(other) => KeyValue::Other(other.to_string()),
        }
    }
}

/// The `(hash, range)` pair identifying a record within the store.
///
/// A component is `None` when the record has no value for that field, or
/// when the schema declares no range key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyTuple {
    pub hash: Option<KeyValue>,
    pub range: Option<KeyValue>,
}
