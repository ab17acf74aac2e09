//! Records, their field values and the delivery units that carry them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{FlushError, Result};

/// An ordered mapping of field name to value.
///
/// Field order is the insertion order of the upstream payload, so a record
/// serializes back the way it arrived plus any fields added by formatting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Set `field`, returning the previous value if there was one.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    /// Tagged view of a field's value.
    pub fn field(&self, field: &str) -> Option<FieldValue<'_>> {
        self.fields.get(field).map(FieldValue::of)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }

    /// Length of the record's JSON encoding.
    ///
    /// This is the size estimate used for batch byte accounting. It tracks
    /// the store's wire size closely but is not an exact bound.
    pub fn encoded_len(&self) -> Result<usize> {
        let mut counter = ByteCounter(0);
        serde_json::to_writer(&mut counter, &self.fields)?;
        Ok(counter.0)
    }
}

impl TryFrom<Value> for Record {
    type Error = FlushError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Record { fields }),
            other => Err(FlushError::Serialization(format!(
                "record must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.fields)
    }
}

struct ByteCounter(usize);

impl std::io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Tagged view over a record value.
///
/// Booleans and nulls have no scalar key meaning and are reported as
/// `Nested` along with arrays and objects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    String(&'a str),
    Number(&'a Number),
    Nested(&'a Value),
}

impl<'a> FieldValue<'a> {
    pub fn of(value: &'a Value) -> Self {
        match value {
            Value::String(s) => FieldValue::String(s),
            Value::Number(n) => FieldValue::Number(n),
            other => FieldValue::Nested(other),
        }
    }
}

/// Renders the value as JSON, so strings keep their quotes.
impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) => write!(f, "{}", Value::from(*s)),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Nested(v) => write!(f, "{}", v),
        }
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A raw upstream record together with its event time.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub record: Record,
}

impl Event {
    pub fn new(time: DateTime<Utc>, record: Record) -> Self {
        Self { time, record }
    }
}

/// One block of records handed over for a single flush attempt.
///
/// Owned by the upstream side and redelivered as a whole on failure. The
/// flush path only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryUnit {
    pub id: u64,
    pub events: Vec<Event>,
}

impl DeliveryUnit {
    pub fn new(id: u64, events: Vec<Event>) -> Self {
        Self { id, events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_try_from_object() {
        let record = Record::try_from(json!({"a": 1, "b": "x"})).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_try_from_non_object_fails() {
        assert!(Record::try_from(json!([1, 2])).is_err());
        assert!(Record::try_from(json!("x")).is_err());
    }

    #[test]
    fn test_insert_preserves_order() {
        let mut record = Record::try_from(json!({"z": 1, "a": 2})).unwrap();
        record.insert("m", 3);
        let keys: Vec<&str> = record.fields().keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_encoded_len_matches_to_string() {
        let record = Record::try_from(json!({"id": "abc", "n": 42, "nested": {"k": [1, 2]}}))
            .unwrap();
        let expected = serde_json::to_string(&record).unwrap().len();
        assert_eq!(record.encoded_len().unwrap(), expected);
    }

    #[test]
    fn test_encoded_len_empty() {
        assert_eq!(Record::new().encoded_len().unwrap(), 2);
    }

    #[test]
    fn test_field_value_tags() {
        let record =
            Record::try_from(json!({"s": "x", "n": 1, "b": true, "o": {"k": 1}})).unwrap();
        assert!(matches!(record.field("s"), Some(FieldValue::String("x"))));
        assert!(matches!(record.field("n"), Some(FieldValue::Number(_))));
        assert!(matches!(record.field("b"), Some(FieldValue::Nested(_))));
        assert!(matches!(record.field("o"), Some(FieldValue::Nested(_))));
        assert!(record.field("missing").is_none());
    }

    #[test]
    fn test_field_value_displays_as_json() {
        let record = Record::try_from(json!({"s": "a\"b", "n": 1.5, "o": [1]})).unwrap();
        assert_eq!(record.field("s").unwrap().to_string(), r#""a\"b""#);
        assert_eq!(record.field("n").unwrap().to_string(), "1.5");
        assert_eq!(record.field("o").unwrap().to_string(), "[1]");
    }

    #[test]
    fn test_delivery_unit_len() {
        let unit = DeliveryUnit::new(
            7,
            vec![Event::new(Utc::now(), Record::new())],
        );
        assert_eq!(unit.id, 7);
        assert_eq!(unit.len(), 1);
        assert!(!unit.is_empty());
    }
}
