//! Newline-delimited JSON source.
//!
//! Turns a byte stream of JSON objects, one per line, into delivery units.
//! Lines that are blank are skipped silently; lines that do not parse as a
//! JSON object are logged and skipped.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dynaflush_core::{DeliveryUnit, Event, FlushError, Record, Result};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

fn default_unit_max_records() -> usize {
    1000
}

/// Source configuration.
///
/// | Key                | Description                                 | Default |
/// |--------------------|---------------------------------------------|---------|
/// | `unit.max_records` | Records per delivery unit                   | `1000`  |
/// | `time.key`         | Field holding the event time (epoch secs)   | none    |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub unit_max_records: usize,
    pub time_key: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            unit_max_records: default_unit_max_records(),
            time_key: None,
        }
    }
}

impl SourceConfig {
    /// Parse a SourceConfig from a string key-value map.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let unit_max_records = match config.get("unit.max_records") {
            Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
                FlushError::Config(format!("invalid unit.max_records: '{}'", raw))
            })?,
            None => default_unit_max_records(),
        };
        if unit_max_records == 0 {
            return Err(FlushError::Config(
                "unit.max_records must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            unit_max_records,
            time_key: config
                .get("time.key")
                .filter(|s| !s.trim().is_empty())
                .cloned(),
        })
    }
}

/// Reads delivery units from an NDJSON stream.
pub struct NdjsonSource<R> {
    reader: R,
    buf: Vec<u8>,
    config: SourceConfig,
    line_no: u64,
    next_id: u64,
    exhausted: bool,
}

impl<R: AsyncBufRead + Unpin> NdjsonSource<R> {
    pub fn new(reader: R, config: SourceConfig) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            config,
            line_no: 0,
            next_id: 0,
            exhausted: false,
        }
    }

    /// Read the next unit. Returns `None` once the stream is exhausted and
    /// every buffered record has been handed out.
    pub async fn next_unit(&mut self) -> Result<Option<DeliveryUnit>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut events = Vec::new();
        while events.len() < self.config.unit_max_records {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                self.exhausted = true;
                break;
            }
            self.line_no += 1;

            if let Some(event) = self.parse_line(&self.buf) {
                events.push(event);
            }
        }

        if events.is_empty() {
            return Ok(None);
        }

        let unit = DeliveryUnit::new(self.next_id, events);
        self.next_id += 1;
        tracing::debug!(unit = unit.id, records = unit.len(), "unit read");
        Ok(Some(unit))
    }

    // Works on raw bytes: invalid UTF-8 is skipped like any unparseable line.
    fn parse_line(&self, line: &[u8]) -> Option<Event> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let record = match serde_json::from_slice::<Value>(line) {
            Ok(value) => match Record::try_from(value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(line = self.line_no, error = %e, "skipping non-object line");
                    return None;
                }
            },
            Err(e) => {
                tracing::warn!(line = self.line_no, error = %e, "skipping unparseable line");
                return None;
            }
        };

        let time = self
            .config
            .time_key
            .as_deref()
            .and_then(|key| record.get(key))
            .and_then(epoch_seconds)
            .unwrap_or_else(Utc::now);

        Some(Event::new(time, record))
    }
}

fn epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(secs) = value.as_i64() {
        return DateTime::from_timestamp(secs, 0);
    }
    let secs = value.as_f64()?;
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}
