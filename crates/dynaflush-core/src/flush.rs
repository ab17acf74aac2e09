//! Flush controller: runs one delivery unit through formatting, batching and
//! the write executor, and turns the result into an outcome for upstream.
//!
//! ## Failure policy
//!
//! - **Transport** failures fail the unit. The executor is asked to
//!   reconnect and upstream redelivers the whole unit. Redelivery is safe:
//!   puts overwrite, deletes of missing keys are no-ops, and dedup state is
//!   rebuilt from scratch on every attempt.
//! - **Validation** failures are handled per batch by the accumulator's
//!   [`ValidationPolicy`]; under the drop policies the unit still succeeds.
//! - **Configuration** problems are caught by [`FlushController::initialize`]
//!   before any unit is accepted.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::batch::{
    Batch, BatchAccumulator, BatchLimits, BatchSink, FlushStats, ValidationPolicy,
};
use crate::config::SinkConfig;
use crate::error::{FailureKind, FlushError, Result};
use crate::executor::{KeySchemaProvider, WriteExecutor, WriteMode};
use crate::format::RecordFormatter;
use crate::record::DeliveryUnit;
use crate::schema::KeySchema;

/// Result of flushing one delivery unit.
#[derive(Debug)]
pub enum FlushOutcome {
    Success(FlushStats),
    /// The unit must be redelivered.
    Failure(FlushError),
}

impl FlushOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FlushOutcome::Success(_))
    }
}

/// Routes closed batches to the executor call matching the write mode.
struct ExecutorSink<'a> {
    executor: &'a dyn WriteExecutor,
    table: &'a str,
    mode: WriteMode,
}

#[async_trait]
impl BatchSink for ExecutorSink<'_> {
    async fn write(&mut self, batch: &Batch) -> Result<()> {
        match self.mode {
            WriteMode::Put => self.executor.put_batch(self.table, batch.records()).await,
            WriteMode::Delete => self.executor.delete_batch(self.table, batch.records()).await,
        }
    }
}

/// Flushes delivery units to one table.
///
/// Cheap to clone; clones share the executor handle but never batch state.
#[derive(Clone)]
pub struct FlushController {
    table: String,
    mode: WriteMode,
    formatter: RecordFormatter,
    limits: BatchLimits,
    policy: ValidationPolicy,
    executor: Arc<dyn WriteExecutor>,
}

impl FlushController {
    /// Build a controller for an already-resolved key schema.
    pub fn new(
        config: &SinkConfig,
        schema: KeySchema,
        executor: Arc<dyn WriteExecutor>,
    ) -> Result<Self> {
        let formatter = RecordFormatter::new(
            schema,
            config.time_formatter()?,
            config.time_field_enabled,
            config.key_coercion,
        );

        Ok(Self {
            table: config.table_name.clone(),
            mode: config.write_mode,
            formatter,
            limits: BatchLimits::new(config.limits.max_items, config.limits.max_bytes),
            policy: config.validation_policy,
            executor,
        })
    }

    /// Resolve the table's key schema and build a controller.
    ///
    /// Any failure here is a configuration error: the process should stop
    /// rather than accept units it cannot write.
    pub async fn initialize(
        config: &SinkConfig,
        provider: &dyn KeySchemaProvider,
        executor: Arc<dyn WriteExecutor>,
    ) -> Result<Self> {
        let schema = provider.key_schema(&config.table_name).await.map_err(|e| match e {
            FlushError::Config(_) => e,
            other => FlushError::Config(format!(
                "failed to load key schema of table '{}': {}",
                config.table_name, other
            )),
        })?;

        info!(
            table = %config.table_name,
            hash_key = %schema.hash_key.name,
            range_key = schema.range_key.as_ref().map(|r| r.name.as_str()).unwrap_or("-"),
            mode = %config.write_mode,
            executor = executor.name(),
            "flush controller initialized"
        );

        Self::new(config, schema, executor)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &KeySchema {
        self.formatter.schema()
    }

    /// Flush one delivery unit.
    pub async fn flush(&self, unit: &DeliveryUnit) -> FlushOutcome {
        match self.try_flush(unit).await {
            Ok(stats) => {
                debug!(
                    unit = unit.id,
                    records = stats.records_in,
                    committed = stats.records_committed,
                    batches = stats.batches_committed,
                    duplicates = stats.duplicates_dropped,
                    rejected = stats.records_rejected,
                    keys_zeroed = stats.keys_coerced_to_zero,
                    "unit flushed"
                );
                if stats.records_rejected > 0 || stats.records_abandoned > 0 {
                    warn!(
                        unit = unit.id,
                        rejected = stats.records_rejected,
                        abandoned = stats.records_abandoned,
                        "unit flushed with dropped records"
                    );
                }
                FlushOutcome::Success(stats)
            }
            Err(e) => {
                if e.kind() == FailureKind::Transport {
                    if let Err(reconnect_err) = self.executor.reconnect().await {
                        error!(
                            executor = self.executor.name(),
                            error = %reconnect_err,
                            "reconnect after transport failure failed"
                        );
                    }
                }
                warn!(unit = unit.id, error = %e, "unit flush failed");
                FlushOutcome::Failure(e)
            }
        }
    }

    async fn try_flush(&self, unit: &DeliveryUnit) -> Result<FlushStats> {
        let formatted = self.formatter.format_unit(unit)?;

        let mut sink = ExecutorSink {
            executor: self.executor.as_ref(),
            table: &self.table,
            mode: self.mode,
        };

        let mut stats = BatchAccumulator::new(self.formatter.schema(), self.limits, self.policy)
            .accumulate(formatted.records, &mut sink)
            .await?;
        stats.keys_coerced_to_zero = formatted.keys_coerced_to_zero;
        Ok(stats)
    }
}

impl std::fmt::Debug for FlushController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushController")
            .field("table", &self.table)
            .field("mode", &self.mode)
            .field("limits", &self.limits)
            .field("policy", &self.policy)
            .field("executor", &self.executor.name())
            .finish()
    }
}
