//! The store-facing side of the flush path.
//!
//! [`WriteExecutor`] issues one batch put or delete against the store and
//! reports success or a typed failure. [`KeySchemaProvider`] resolves a
//! table's key layout once at startup. Both are implemented by the real
//! store client and by [`InMemoryExecutor`], a scripted stand-in that keeps
//! the committed items in memory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::batch::MAX_BATCH_ITEMS;
use crate::error::{FailureKind, FlushError, Result};
use crate::record::Record;
use crate::schema::{KeySchema, KeyTuple, Scalar};

/// Whether batches are written as puts or deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Put,
    Delete,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Put => write!(f, "put"),
            WriteMode::Delete => write!(f, "delete"),
        }
    }
}

/// Performs batch writes against the store.
///
/// Each call is all-or-nothing. Implementations must report a structural
/// rejection as [`FlushError::Validation`] and anything network-related as
/// [`FlushError::Transport`].
#[async_trait]
pub trait WriteExecutor: Send + Sync {
    /// Insert or overwrite up to 25 records.
    async fn put_batch(&self, table: &str, records: &[Record]) -> Result<()>;

    /// Delete up to 25 records by key.
    async fn delete_batch(&self, table: &str, records: &[Record]) -> Result<()>;

    /// Re-establish the connection after a transport failure.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Return a short name for logging.
    fn name(&self) -> &str;
}

/// Resolves the key schema of a table.
#[async_trait]
pub trait KeySchemaProvider: Send + Sync {
    async fn key_schema(&self, table: &str) -> Result<KeySchema>;
}

/// A committed call as seen by [`InMemoryExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorCall {
    pub mode: WriteMode,
    pub table: String,
    pub records: Vec<Record>,
}

#[derive(Debug, Default)]
struct MemoryState {
    items: HashMap<KeyTuple, Record>,
    committed: Vec<ExecutorCall>,
    calls: usize,
    reconnects: usize,
    scripted: HashMap<usize, FailureKind>,
    queued: VecDeque<FailureKind>,
}

/// A single-table store kept in memory.
///
/// Validates batches the way the real store does (item ceiling, duplicate
/// keys, key presence and key types) and can be scripted to fail specific
/// calls.
#[derive(Debug)]
pub struct InMemoryExecutor {
    table: String,
    schema: KeySchema,
    state: Mutex<MemoryState>,
}

impl InMemoryExecutor {
    pub fn new(table: impl Into<String>, schema: KeySchema) -> Self {
        Self {
            table: table.into(),
            schema,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Fail call number `call` (0-based, counting puts and deletes).
    pub async fn fail_call(&self, call: usize, kind: FailureKind) {
        self.state.lock().await.scripted.insert(call, kind);
    }

    /// Fail the next call that has no other script.
    pub async fn fail_next(&self, kind: FailureKind) {
        self.state.lock().await.queued.push_back(kind);
    }

    /// Every call that committed, in order.
    pub async fn committed(&self) -> Vec<ExecutorCall> {
        self.state.lock().await.committed.clone()
    }

    /// Key tuples currently stored.
    pub async fn stored_keys(&self) -> HashSet<KeyTuple> {
        self.state.lock().await.items.keys().cloned().collect()
    }

    pub async fn get(&self, key: &KeyTuple) -> Option<Record> {
        self.state.lock().await.items.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Total calls made, failed ones included.
    pub async fn calls(&self) -> usize {
        self.state.lock().await.calls
    }

    pub async fn reconnects(&self) -> usize {
        self.state.lock().await.reconnects
    }

    fn validate(&self, table: &str, records: &[Record]) -> Result<Vec<KeyTuple>> {
        if table != self.table {
            return Err(FlushError::Validation(format!(
                "requested resource not found: table '{}'",
                table
            )));
        }
        if records.is_empty() || records.len() > MAX_BATCH_ITEMS {
            return Err(FlushError::Validation(format!(
                "batch must hold between 1 and {} items, got {}",
                MAX_BATCH_ITEMS,
                records.len()
            )));
        }

        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            for attr in self.schema.attributes() {
                let matches = match (record.get(&attr.name), attr.scalar) {
                    (Some(Value::String(_)), Scalar::String) => true,
                    (Some(Value::Number(_)), Scalar::Number) => true,
                    _ => false,
                };
                if !matches {
                    return Err(FlushError::Validation(format!(
                        "key attribute '{}' missing or not of type {}",
                        attr.name, attr.scalar
                    )));
                }
            }

            let key = self.schema.key_tuple(record);
            if !seen.insert(key) {
                return Err(FlushError::Validation(
                    "provided list of item keys contains duplicates".to_string(),
                ));
            }
        }

        Ok(records.iter().map(|r| self.schema.key_tuple(r)).collect())
    }

    async fn apply(&self, mode: WriteMode, table: &str, records: &[Record]) -> Result<()> {
        let mut state = self.state.lock().await;
        let call = state.calls;
        state.calls += 1;

        let scripted = match state.scripted.remove(&call) {
            Some(kind) => Some(kind),
            None => state.queued.pop_front(),
        };
        if let Some(kind) = scripted {
            return Err(FlushError::of_kind(
                kind,
                format!("injected failure on call {}", call),
            ));
        }

        let keys = self.validate(table, records)?;
        for (key, record) in keys.into_iter().zip(records) {
            match mode {
                WriteMode::Put => {
                    state.items.insert(key, record.clone());
                }
                WriteMode::Delete => {
                    state.items.remove(&key);
                }
            }
        }
        state.committed.push(ExecutorCall {
            mode,
            table: table.to_string(),
            records: records.to_vec(),
        });
        Ok(())
    }
}

#[async_trait]
impl WriteExecutor for InMemoryExecutor {
    async fn put_batch(&self, table: &str, records: &[Record]) -> Result<()> {
        self.apply(WriteMode::Put, table, records).await
    }

    async fn delete_batch(&self, table: &str, records: &[Record]) -> Result<()> {
        self.apply(WriteMode::Delete, table, records).await
    }

    async fn reconnect(&self) -> Result<()> {
        self.state.lock().await.reconnects += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

#[async_trait]
impl KeySchemaProvider for InMemoryExecutor {
    async fn key_schema(&self, table: &str) -> Result<KeySchema> {
        if table == self.table {
            Ok(self.schema.clone())
        } else {
            Err(FlushError::Config(format!("table '{}' does not exist", table)))
        }
    }
}
