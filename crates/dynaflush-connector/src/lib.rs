//! dynaflush connector
//!
//! The process around the core flush path: where delivery units come from,
//! who runs the flushes, and the store client that performs the writes.
//!
//! ## Architecture
//!
//! - **Source**: `NdjsonSource` cuts a newline-delimited JSON stream into delivery units.
//! - **Runtime**: `WorkerPool` runs isolated flush controllers and redelivers failed units.
//! - **Retry**: `RetryPolicy` supplies the backoff schedule for redelivery and resends.
//! - **DynamoDB**: `DynamoDbExecutor` implements the core executor seam over `aws-sdk-dynamodb`.
//!
//! ## Feature Flags
//!
//! - `dynamodb` - Enables the DynamoDB executor and the `dynaflush` binary.

#[cfg(feature = "dynamodb")]
pub mod dynamodb;
pub mod retry;
pub mod runtime;
pub mod source;

pub use retry::{retry_with_backoff, RetryPolicy};
pub use runtime::{pump, PoolStats, WorkerPool};
pub use source::{NdjsonSource, SourceConfig};

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoDbExecutor;
