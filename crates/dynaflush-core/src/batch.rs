//! Batch accumulation.
//!
//! Groups a stream of formatted records into batches the store will accept
//! in a single request, and hands each closed batch to a [`BatchSink`].
//!
//! ## Flush Triggers
//!
//! A batch is closed and dispatched when ANY of these hold:
//! - **Items**: it holds `max_items` records (store ceiling: 25)
//! - **Bytes**: its size estimate reached `max_bytes` (store ceiling: 1 MiB)
//! - **Headroom**: the next record would push it past `max_bytes`
//! - **End of input**: the record stream is exhausted
//!
//! ## Dedup
//!
//! Within one batch a key tuple appears at most once: the first record
//! wins and later ones are dropped. Dedup does not span batches, so the
//! same key may still be written twice when a batch boundary falls between
//! two occurrences.

use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::ops::ControlFlow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{FailureKind, FlushError, Result};
use crate::record::Record;
use crate::schema::{KeySchema, KeyTuple};

/// Maximum number of items the store accepts in one batch request.
pub const MAX_BATCH_ITEMS: usize = 25;

/// Maximum aggregate size the store accepts in one batch request.
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Per-batch ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl BatchLimits {
    /// Build limits, clamped to `1..=` the store ceilings.
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            max_items: max_items.clamp(1, MAX_BATCH_ITEMS),
            max_bytes: max_bytes.clamp(1, MAX_BATCH_BYTES),
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: MAX_BATCH_ITEMS,
            max_bytes: MAX_BATCH_BYTES,
        }
    }
}

/// What happens to a unit when the store rejects one of its batches as
/// invalid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Drop the rejected batch and keep going with the rest of the unit.
    #[default]
    DropBatch,
    /// Drop the rejected batch and abandon the rest of the unit.
    DropUnit,
    /// Fail the whole unit so it is redelivered.
    FailUnit,
}

impl ValidationPolicy {
    /// Parse from a string (case-insensitive).
    pub fn from_str_config(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "drop_batch" => Ok(ValidationPolicy::DropBatch),
            "drop_unit" => Ok(ValidationPolicy::DropUnit),
            "fail_unit" => Ok(ValidationPolicy::FailUnit),
            other => Err(FlushError::Config(format!(
                "unknown validation.policy: '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ValidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPolicy::DropBatch => write!(f, "drop_batch"),
            ValidationPolicy::DropUnit => write!(f, "drop_unit"),
            ValidationPolicy::FailUnit => write!(f, "fail_unit"),
        }
    }
}

/// A group of records dispatched together as one store request.
///
/// Holds no two records with the same key tuple.
#[derive(Debug, Default)]
pub struct Batch {
    records: Vec<Record>,
    keys: HashSet<KeyTuple>,
    byte_size: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_count(&self) -> usize {
        self.records.len()
    }

    /// Sum of the size estimates of the records in this batch.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_key(&self, key: &KeyTuple) -> bool {
        self.keys.contains(key)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    fn push(&mut self, record: Record, key: KeyTuple, size: usize) {
        self.records.push(record);
        self.keys.insert(key);
        self.byte_size += size;
    }
}

/// Counters describing what happened to one delivery unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub records_in: usize,
    pub batches_committed: usize,
    pub records_committed: usize,
    pub duplicates_dropped: usize,
    pub oversize_dropped: usize,
    pub batches_rejected: usize,
    pub records_rejected: usize,
    /// Records never offered to a batch because the unit was abandoned.
    pub records_abandoned: usize,
    /// Numeric key fields that did not read as a number and were written as 0.
    pub keys_coerced_to_zero: usize,
}

/// Receives closed batches.
#[async_trait]
pub trait BatchSink: Send {
    /// Write one batch. The batch is discarded afterwards either way.
    async fn write(&mut self, batch: &Batch) -> Result<()>;
}

/// Streams records into store-compliant batches.
///
/// One accumulator serves one delivery unit; its state never outlives the
/// call to [`accumulate`](BatchAccumulator::accumulate).
#[derive(Debug)]
pub struct BatchAccumulator<'a> {
    schema: &'a KeySchema,
    limits: BatchLimits,
    policy: ValidationPolicy,
    open: Batch,
    stats: FlushStats,
}

impl<'a> BatchAccumulator<'a> {
    pub fn new(schema: &'a KeySchema, limits: BatchLimits, policy: ValidationPolicy) -> Self {
        Self {
            schema,
            limits,
            policy,
            open: Batch::new(),
            stats: FlushStats::default(),
        }
    }

    /// Consume `records` in order, dispatching every closed batch to `sink`.
    ///
    /// Validation failures from the sink are handled according to the
    /// policy; every other failure is returned unchanged.
    pub async fn accumulate<I, S>(mut self, records: I, sink: &mut S) -> Result<FlushStats>
    where
        I: IntoIterator<Item = Record>,
        S: BatchSink + ?Sized,
    {
        let mut records = records.into_iter();

        while let Some(record) = records.next() {
            self.stats.records_in += 1;

            if self.offer(record, sink).await?.is_break() {
                let remaining = records.count();
                self.stats.records_in += remaining;
                self.stats.records_abandoned += remaining;
                return Ok(self.stats);
            }
        }

        if !self.open.is_empty() {
            // the unit is exhausted, nothing follows a break here
            let _ = self.close(sink).await?;
        }

        Ok(self.stats)
    }

    async fn offer<S>(&mut self, record: Record, sink: &mut S) -> Result<ControlFlow<()>>
    where
        S: BatchSink + ?Sized,
    {
        let key = self.schema.key_tuple(&record);
        if self.open.contains_key(&key) {
            trace!(?key, "dropping duplicate key within batch");
            self.stats.duplicates_dropped += 1;
            return Ok(ControlFlow::Continue(()));
        }

        let size = record.encoded_len()?;
        if size > self.limits.max_bytes {
            warn!(
                ?key,
                size,
                max_bytes = self.limits.max_bytes,
                "dropping record larger than the batch byte limit"
            );
            self.stats.oversize_dropped += 1;
            return Ok(ControlFlow::Continue(()));
        }

        if !self.open.is_empty() && self.open.byte_size() + size > self.limits.max_bytes {
            if self.close(sink).await?.is_break() {
                self.stats.records_abandoned += 1;
                return Ok(ControlFlow::Break(()));
            }
        }

        self.open.push(record, key, size);

        if self.open.item_count() >= self.limits.max_items
            || self.open.byte_size() >= self.limits.max_bytes
        {
            return self.close(sink).await;
        }

        Ok(ControlFlow::Continue(()))
    }

    async fn close<S>(&mut self, sink: &mut S) -> Result<ControlFlow<()>>
    where
        S: BatchSink + ?Sized,
    {
        let batch = mem::take(&mut self.open);
        let items = batch.item_count();

        match sink.write(&batch).await {
            Ok(()) => {
                debug!(items, bytes = batch.byte_size(), "batch committed");
                self.stats.batches_committed += 1;
                self.stats.records_committed += items;
                Ok(ControlFlow::Continue(()))
            }
            Err(e) if e.kind() == FailureKind::Validation => match self.policy {
                ValidationPolicy::DropBatch => {
                    warn!(error = %e, dropped = items, "store rejected batch, dropping it");
                    self.stats.batches_rejected += 1;
                    self.stats.records_rejected += items;
                    Ok(ControlFlow::Continue(()))
                }
                ValidationPolicy::DropUnit => {
                    warn!(
                        error = %e,
                        dropped = items,
                        "store rejected batch, abandoning the rest of the unit"
                    );
                    self.stats.batches_rejected += 1;
                    self.stats.records_rejected += items;
                    Ok(ControlFlow::Break(()))
                }
                ValidationPolicy::FailUnit => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Scalar;
    use serde_json::{json, Value};

    /// Collects batches; fails the call numbers listed in `fail`.
    #[derive(Default)]
    struct VecSink {
        batches: Vec<Vec<Record>>,
        sizes: Vec<usize>,
        calls: usize,
        fail: Vec<(usize, FailureKind)>,
    }

    #[async_trait]
    impl BatchSink for VecSink {
        async fn write(&mut self, batch: &Batch) -> Result<()> {
            let call = self.calls;
            self.calls += 1;
            if let Some((_, kind)) = self.fail.iter().find(|(n, _)| *n == call) {
                return Err(FlushError::of_kind(*kind, format!("scripted failure {call}")));
            }
            self.sizes.push(batch.byte_size());
            self.batches.push(batch.records().to_vec());
            Ok(())
        }
    }

    fn rec(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    fn ids(n: usize) -> Vec<Record> {
        (0..n).map(|i| rec(json!({"id": format!("k{i}")}))).collect()
    }

    fn schema() -> KeySchema {
        KeySchema::simple("id", Scalar::String)
    }

    fn accumulator(schema: &KeySchema, policy: ValidationPolicy) -> BatchAccumulator<'_> {
        BatchAccumulator::new(schema, BatchLimits::default(), policy)
    }

    // ---------------------------------------------------------------
    // Limits
    // ---------------------------------------------------------------

    #[test]
    fn test_limits_default_to_store_ceilings() {
        let limits = BatchLimits::default();
        assert_eq!(limits.max_items, 25);
        assert_eq!(limits.max_bytes, 1_048_576);
    }

    #[test]
    fn test_limits_clamped() {
        let limits = BatchLimits::new(100, 10 * 1024 * 1024);
        assert_eq!(limits, BatchLimits::default());
        let limits = BatchLimits::new(0, 0);
        assert_eq!(limits.max_items, 1);
        assert_eq!(limits.max_bytes, 1);
    }

    #[test]
    fn test_policy_parse_and_display() {
        for policy in [
            ValidationPolicy::DropBatch,
            ValidationPolicy::DropUnit,
            ValidationPolicy::FailUnit,
        ] {
            assert_eq!(
                ValidationPolicy::from_str_config(&policy.to_string()).unwrap(),
                policy
            );
        }
        assert!(ValidationPolicy::from_str_config("retry").is_err());
    }

    // ---------------------------------------------------------------
    // Item ceiling
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_thirty_records_make_two_batches() {
        let schema = schema();
        let mut sink = VecSink::default();
        let stats = accumulator(&schema, ValidationPolicy::default())
            .accumulate(ids(30), &mut sink)
            .await
            .unwrap();

        let sizes: Vec<usize> = sink.batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![25, 5]);
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(stats.records_committed, 30);
        assert_eq!(sink.batches[0][0].get("id"), Some(&json!("k0")));
        assert_eq!(sink.batches[1][0].get("id"), Some(&json!("k25")));
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let schema = schema();
        let mut sink = VecSink::default();
        accumulator(&schema, ValidationPolicy::default())
            .accumulate(ids(50), &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.calls, 2);
    }

    #[tokio::test]
    async fn test_empty_input_dispatches_nothing() {
        let schema = schema();
        let mut sink = VecSink::default();
        let stats = accumulator(&schema, ValidationPolicy::default())
            .accumulate(Vec::new(), &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.calls, 0);
        assert_eq!(stats, FlushStats::default());
    }

    // ---------------------------------------------------------------
    // Byte ceiling
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_byte_ceiling_never_exceeded() {
        let schema = schema();
        let payload = "x".repeat(300);
        let records: Vec<Record> = (0..20)
            .map(|i| rec(json!({"id": format!("k{i}"), "p": payload})))
            .collect();
        let one = records[0].encoded_len().unwrap();
        let limits = BatchLimits::new(25, one * 3 + one / 2);

        let mut sink = VecSink::default();
        BatchAccumulator::new(&schema, limits, ValidationPolicy::default())
            .accumulate(records, &mut sink)
            .await
            .unwrap();

        for (batch, size) in sink.batches.iter().zip(&sink.sizes) {
            assert!(*size <= limits.max_bytes);
            assert!(batch.len() <= 3);
        }
        let total: usize = sink.batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn test_batch_closes_when_bytes_reached() {
        let schema = schema();
        let records = ids(4);
        let one = records[0].encoded_len().unwrap();
        let limits = BatchLimits::new(25, one * 2);

        let mut sink = VecSink::default();
        BatchAccumulator::new(&schema, limits, ValidationPolicy::default())
            .accumulate(records, &mut sink)
            .await
            .unwrap();
        let sizes: Vec<usize> = sink.batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2]);
    }

    #[tokio::test]
    async fn test_oversize_record_dropped() {
        let schema = schema();
        let records = vec![
            rec(json!({"id": "small"})),
            rec(json!({"id": "big", "p": "y".repeat(500)})),
            rec(json!({"id": "small2"})),
        ];
        let limits = BatchLimits::new(25, 100);

        let mut sink = VecSink::default();
        let stats = BatchAccumulator::new(&schema, limits, ValidationPolicy::default())
            .accumulate(records, &mut sink)
            .await
            .unwrap();
        assert_eq!(stats.oversize_dropped, 1);
        assert_eq!(stats.records_committed, 2);
        assert_eq!(sink.batches.len(), 1);
    }

    // ---------------------------------------------------------------
    // Dedup
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_first_occurrence_wins() {
        let schema = schema();
        let records = vec![
            rec(json!({"id": "a", "v": 1})),
            rec(json!({"id": "b", "v": 2})),
            rec(json!({"id": "a", "v": 3})),
        ];
        let mut sink = VecSink::default();
        let stats = accumulator(&schema, ValidationPolicy::default())
            .accumulate(records, &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.batches.len(), 1);
        let batch = &sink.batches[0];
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].get("v"), Some(&json!(1)));
        assert!(batch.iter().all(|r| r.get("v") != Some(&json!(3))));
        assert_eq!(stats.duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_composite_key_dedup_uses_range() {
        let schema = KeySchema::composite("id", Scalar::String, "ts", Scalar::String);
        let records = vec![
            rec(json!({"id": "a", "ts": "1"})),
            rec(json!({"id": "a", "ts": "2"})),
            rec(json!({"id": "a", "ts": "1"})),
        ];
        let mut sink = VecSink::default();
        accumulator(&schema, ValidationPolicy::default())
            .accumulate(records, &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.batches[0].len(), 2);
    }

    #[tokio::test]
    async fn test_dedup_does_not_span_batches() {
        let schema = schema();
        let mut records = ids(25);
        records.push(rec(json!({"id": "k0", "second": true})));

        let mut sink = VecSink::default();
        let stats = accumulator(&schema, ValidationPolicy::default())
            .accumulate(records, &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.batches.len(), 2);
        assert_eq!(sink.batches[1][0].get("id"), Some(&json!("k0")));
        assert_eq!(stats.duplicates_dropped, 0);
    }

    #[tokio::test]
    async fn test_duplicates_do_not_count_toward_items() {
        let schema = schema();
        let mut records = Vec::new();
        for i in 0..26 {
            records.push(rec(json!({"id": format!("k{i}")})));
            if i < 24 {
                records.push(rec(json!({"id": format!("k{i}")})));
            }
        }
        let mut sink = VecSink::default();
        accumulator(&schema, ValidationPolicy::default())
            .accumulate(records, &mut sink)
            .await
            .unwrap();
        let sizes: Vec<usize> = sink.batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![25, 1]);
    }

    // ---------------------------------------------------------------
    // Failure handling
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_validation_drop_batch_continues() {
        let schema = schema();
        let mut sink = VecSink {
            fail: vec![(0, FailureKind::Validation)],
            ..Default::default()
        };
        let stats = accumulator(&schema, ValidationPolicy::DropBatch)
            .accumulate(ids(30), &mut sink)
            .await
            .unwrap();

        assert_eq!(stats.batches_rejected, 1);
        assert_eq!(stats.records_rejected, 25);
        assert_eq!(stats.records_committed, 5);
        assert_eq!(sink.batches.len(), 1);
        assert_eq!(sink.batches[0][0].get("id"), Some(&json!("k25")));
    }

    #[tokio::test]
    async fn test_validation_drop_unit_abandons_rest() {
        let schema = schema();
        let mut sink = VecSink {
            fail: vec![(0, FailureKind::Validation)],
            ..Default::default()
        };
        let stats = accumulator(&schema, ValidationPolicy::DropUnit)
            .accumulate(ids(60), &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.calls, 1);
        assert_eq!(stats.records_in, 60);
        assert_eq!(stats.records_rejected, 25);
        assert_eq!(stats.records_abandoned, 35);
        assert_eq!(stats.records_committed, 0);
    }

    #[tokio::test]
    async fn test_validation_fail_unit_propagates() {
        let schema = schema();
        let mut sink = VecSink {
            fail: vec![(1, FailureKind::Validation)],
            ..Default::default()
        };
        let err = accumulator(&schema, ValidationPolicy::FailUnit)
            .accumulate(ids(30), &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation);
        assert_eq!(sink.batches.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let schema = schema();
        let mut sink = VecSink {
            fail: vec![(0, FailureKind::Transport)],
            ..Default::default()
        };
        let err = accumulator(&schema, ValidationPolicy::DropBatch)
            .accumulate(ids(30), &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transport);
        assert_eq!(sink.calls, 1);
    }
}
