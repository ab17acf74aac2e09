//! Key resolution: fill in missing key fields and coerce them to the
//! scalar type the table declares.
//!
//! Coercion to a number follows integer-prefix semantics: leading
//! whitespace and an optional sign are accepted, digits are read until the
//! first other character (single underscores between digits are allowed),
//! JSON floats truncate toward zero, and anything else reads as zero. A zero
//! result is reported as [`Coercion::Failed`] because it almost always means
//! the value was not a number at all.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::error::{FlushError, Result};
use crate::record::{FieldValue, Record};
use crate::schema::{KeyAttribute, KeySchema, Scalar};

/// Outcome of coercing a value to a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Parsed(i64),
    /// The value read as zero.
    Failed,
}

/// What to do when a numeric key field reads as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoercionMode {
    /// Log at error level and write the zero.
    #[default]
    Lenient,
    /// Fail the record with [`FlushError::KeyCoercion`].
    Strict,
}

impl CoercionMode {
    /// Parse from a string (case-insensitive).
    pub fn from_str_config(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lenient" => Ok(CoercionMode::Lenient),
            "strict" => Ok(CoercionMode::Strict),
            other => Err(FlushError::Config(format!(
                "unknown key.coercion: '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CoercionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoercionMode::Lenient => write!(f, "lenient"),
            CoercionMode::Strict => write!(f, "strict"),
        }
    }
}

/// Coerce a field value to an integer.
pub fn coerce_number(value: FieldValue<'_>) -> Coercion {
    let parsed = match value {
        FieldValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                i
            } else if n.as_u64().is_some() {
                i64::MAX
            } else {
                // saturating, NaN is not representable in JSON
                n.as_f64().map_or(0, |f| f.trunc() as i64)
            }
        }
        FieldValue::String(s) => parse_integer_prefix(s),
        FieldValue::Nested(_) => 0,
    };

    if parsed == 0 {
        Coercion::Failed
    } else {
        Coercion::Parsed(parsed)
    }
}

/// Render a field value as a string key.
pub fn coerce_string(value: FieldValue<'_>) -> String {
    match value {
        FieldValue::String(s) => s.to_string(),
        other => other.to_string(),
    }
}

fn parse_integer_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let bytes = digits.as_bytes();
    let mut acc: i64 = 0;
    let mut after_digit = false;
    for (i, &b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() {
            let d = i64::from(b - b'0');
            acc = if negative {
                acc.saturating_mul(10).saturating_sub(d)
            } else {
                acc.saturating_mul(10).saturating_add(d)
            };
            after_digit = true;
        } else if b == b'_'
            && after_digit
            && bytes.get(i + 1).is_some_and(|next| next.is_ascii_digit())
        {
            after_digit = false;
        } else {
            break;
        }
    }
    acc
}

/// Generate a unique, time-ordered hash key value.
pub fn generate_hash_key() -> String {
    Uuid::now_v7().to_string()
}

/// What [`KeyResolver::resolve`] changed on a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyResolution {
    pub hash_generated: bool,
    pub range_assigned: bool,
    /// Number of key fields that read as zero and were written as zero.
    pub coercion_failures: usize,
}

/// Fills missing key fields and coerces key fields to their declared type.
///
/// Only adds or rewrites key fields; never removes anything. Calling it
/// twice only fills fields that are still missing.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    schema: KeySchema,
    mode: CoercionMode,
}

impl KeyResolver {
    pub fn new(schema: KeySchema, mode: CoercionMode) -> Self {
        Self { schema, mode }
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    /// Resolve the keys of `record`.
    ///
    /// A missing range key is set to `formatted_time`, the same string the
    /// caller stamps into the `time` field.
    pub fn resolve(&self, record: &mut Record, formatted_time: &str) -> Result<KeyResolution> {
        let mut resolution = KeyResolution::default();

        let hash = &self.schema.hash_key;
        if !record.contains(&hash.name) {
            record.insert(hash.name.clone(), generate_hash_key());
            resolution.hash_generated = true;
        }
        self.coerce(hash, record, &mut resolution)?;

        if let Some(range) = &self.schema.range_key {
            if !record.contains(&range.name) {
                record.insert(range.name.clone(), formatted_time);
                resolution.range_assigned = true;
            }
            self.coerce(range, record, &mut resolution)?;
        }

        Ok(resolution)
    }

    fn coerce(
        &self,
        attr: &KeyAttribute,
        record: &mut Record,
        resolution: &mut KeyResolution,
    ) -> Result<()> {
        let Some(value) = record.field(&attr.name) else {
            return Ok(());
        };

        match attr.scalar {
            Scalar::Number => match coerce_number(value) {
                Coercion::Parsed(n) => {
                    record.insert(attr.name.clone(), n);
                }
                Coercion::Failed => {
                    let raw = value.to_string();
                    if self.mode == CoercionMode::Strict {
                        return Err(FlushError::KeyCoercion {
                            field: attr.name.clone(),
                            raw,
                        });
                    }
                    error!(
                        field = %attr.name,
                        raw = %raw,
                        "failed to cast key field to a number, writing 0"
                    );
                    record.insert(attr.name.clone(), 0);
                    resolution.coercion_failures += 1;
                }
            },
            Scalar::String => {
                if !matches!(value, FieldValue::String(_)) {
                    let s = coerce_string(value);
                    record.insert(attr.name.clone(), s);
                }
            }
        }

        Ok(())
    }
}
