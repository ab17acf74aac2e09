//! Turns raw upstream records into canonical records ready for batching.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::key::{CoercionMode, KeyResolution, KeyResolver};
use crate::record::{DeliveryUnit, Record};
use crate::schema::KeySchema;
use crate::time::TimeFormatter;

/// Name of the field stamped with the formatted event time.
pub const TIME_FIELD: &str = "time";

/// The formatted records of one delivery unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedUnit {
    pub records: Vec<Record>,
    /// Numeric key fields written as 0 across the unit.
    pub keys_coerced_to_zero: usize,
}

/// Formats raw records: resolves keys and stamps the event time.
#[derive(Debug, Clone)]
pub struct RecordFormatter {
    resolver: KeyResolver,
    time: TimeFormatter,
    include_time_field: bool,
}

impl RecordFormatter {
    pub fn new(
        schema: KeySchema,
        time: TimeFormatter,
        include_time_field: bool,
        coercion: CoercionMode,
    ) -> Self {
        Self {
            resolver: KeyResolver::new(schema, coercion),
            time,
            include_time_field,
        }
    }

    pub fn schema(&self) -> &KeySchema {
        self.resolver.schema()
    }

    /// Produce the canonical form of `raw`.
    ///
    /// The event time is formatted once; a range key assigned here and the
    /// `time` field carry the exact same string.
    pub fn format(&self, raw: Record, event_time: DateTime<Utc>) -> Result<Record> {
        self.format_resolved(raw, event_time).map(|(record, _)| record)
    }

    /// Like [`format`](Self::format), also reporting what key resolution changed.
    pub fn format_resolved(
        &self,
        raw: Record,
        event_time: DateTime<Utc>,
    ) -> Result<(Record, KeyResolution)> {
        let mut record = raw;
        let formatted_time = self.time.format(event_time);

        let resolution = self.resolver.resolve(&mut record, &formatted_time)?;

        if self.include_time_field {
            record.insert(TIME_FIELD, formatted_time);
        }

        Ok((record, resolution))
    }

    /// Format every event of `unit` in arrival order.
    ///
    /// The unit itself is left untouched so it can be redelivered.
    pub fn format_unit(&self, unit: &DeliveryUnit) -> Result<FormattedUnit> {
        let mut formatted = FormattedUnit {
            records: Vec::with_capacity(unit.len()),
            keys_coerced_to_zero: 0,
        };
        for event in &unit.events {
            let (record, resolution) = self.format_resolved(event.record.clone(), event.time)?;
            formatted.keys_coerced_to_zero += resolution.coercion_failures;
            formatted.records.push(record);
        }
        Ok(formatted)
    }
}
