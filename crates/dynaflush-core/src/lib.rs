//! dynaflush core
//!
//! Buffers delivery units of structured log records and writes them to a
//! key-value store in batches that respect the store's per-request limits
//! (25 items, 1 MiB).
//!
//! ## Architecture
//!
//! ```text
//! DeliveryUnit ─→ RecordFormatter ─→ BatchAccumulator ─→ WriteExecutor
//!                 (KeyResolver,      (limits, per-batch   (put / delete)
//!                  TimeFormatter)     dedup)
//!        ▲                                                      │
//!        └──────────── FlushController (failure policy) ◀───────┘
//! ```
//!
//! - **Schema**: `KeySchema` describes the table's hash and range keys.
//! - **Format**: `RecordFormatter` fills in missing keys and stamps event time.
//! - **Batch**: `BatchAccumulator` groups records into store-compliant batches.
//! - **Executor**: `WriteExecutor` is the store client seam.
//! - **Flush**: `FlushController` runs one unit end to end and reports the outcome.
//!
//! No network I/O happens here beyond the executor call.

pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod flush;
pub mod format;
pub mod key;
pub mod record;
pub mod schema;
pub mod time;

pub use batch::{
    Batch, BatchAccumulator, BatchLimits, BatchSink, FlushStats, ValidationPolicy,
    MAX_BATCH_BYTES, MAX_BATCH_ITEMS,
};
pub use config::{Credentials, SinkConfig};
pub use error::{FailureKind, FlushError, Result};
pub use executor::{ExecutorCall, InMemoryExecutor, KeySchemaProvider, WriteExecutor, WriteMode};
pub use flush::{FlushController, FlushOutcome};
pub use format::{FormattedUnit, RecordFormatter, TIME_FIELD};
pub use key::{Coercion, CoercionMode, KeyResolution, KeyResolver};
pub use record::{DeliveryUnit, Event, FieldValue, Record};
pub use schema::{KeyAttribute, KeySchema, KeyTuple, KeyValue, Scalar};
pub use time::TimeFormatter;
