//! Sink configuration.
//!
//! Parsed from a flat string map, the way connector configs are declared.
//!
//! ## Configuration
//!
//! | Key                  | Description                                  | Default      |
//! |----------------------|----------------------------------------------|--------------|
//! | `table.name`         | Target table                                 | required     |
//! | `endpoint`           | Store endpoint URL                           | (SDK default)|
//! | `region`             | Store region                                 | (SDK default)|
//! | `aws.key_id`         | Static access key id                         | (chain)      |
//! | `aws.secret_key`     | Static secret key                            | (chain)      |
//! | `proxy.uri`          | Outbound proxy for the store client          | none         |
//! | `time.format`        | strftime format of the derived time string   | ISO 8601     |
//! | `time.localtime`     | Render times in the local timezone           | `false`      |
//! | `time.field.enabled` | Stamp every record with a `time` field       | `true`       |
//! | `delete.mode`        | Dispatch batches as deletes                  | `false`      |
//! | `workers`            | Isolated flush workers                       | `2`          |
//! | `batch.max_items`    | Items per batch (at most 25)                 | `25`         |
//! | `batch.max_bytes`    | Bytes per batch (at most 1048576)            | `1048576`    |
//! | `validation.policy`  | `drop_batch`, `drop_unit` or `fail_unit`     | `drop_batch` |
//! | `key.coercion`       | `lenient` or `strict`                        | `lenient`    |

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::batch::{BatchLimits, ValidationPolicy, MAX_BATCH_BYTES, MAX_BATCH_ITEMS};
use crate::error::{FlushError, Result};
use crate::executor::WriteMode;
use crate::key::CoercionMode;
use crate::time::TimeFormatter;

fn default_workers() -> usize {
    2
}

fn default_true() -> bool {
    true
}

/// Static store credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub key_id: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key_id", &self.key_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Parsed sink configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub table_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub proxy_uri: Option<String>,
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub localtime: bool,
    #[serde(default = "default_true")]
    pub time_field_enabled: bool,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub limits: BatchLimits,
    #[serde(default)]
    pub validation_policy: ValidationPolicy,
    #[serde(default)]
    pub key_coercion: CoercionMode,
}

impl SinkConfig {
    /// Config for `table_name` with every other option at its default.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            endpoint: None,
            region: None,
            credentials: None,
            proxy_uri: None,
            time_format: None,
            localtime: false,
            time_field_enabled: true,
            write_mode: WriteMode::Put,
            workers: default_workers(),
            limits: BatchLimits::default(),
            validation_policy: ValidationPolicy::default(),
            key_coercion: CoercionMode::default(),
        }
    }

    /// Parse a SinkConfig from a string key-value map.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let table_name = config
            .get("table.name")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| FlushError::Config("missing required 'table.name'".to_string()))?
            .clone();

        let credentials = match (config.get("aws.key_id"), config.get("aws.secret_key")) {
            (Some(key_id), Some(secret_key)) => Some(Credentials {
                key_id: key_id.clone(),
                secret_key: secret_key.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(FlushError::Config(
                    "'aws.key_id' and 'aws.secret_key' must be set together".to_string(),
                ))
            }
        };

        let delete_mode = parse_bool(config, "delete.mode")?.unwrap_or(false);

        let workers = parse_usize(config, "workers")?.unwrap_or_else(default_workers);
        if workers == 0 {
            return Err(FlushError::Config("workers must be at least 1".to_string()));
        }

        let limits = BatchLimits::new(
            parse_usize(config, "batch.max_items")?.unwrap_or(MAX_BATCH_ITEMS),
            parse_usize(config, "batch.max_bytes")?.unwrap_or(MAX_BATCH_BYTES),
        );

        let validation_policy = config
            .get("validation.policy")
            .map(|s| ValidationPolicy::from_str_config(s))
            .transpose()?
            .unwrap_or_default();

        let key_coercion = config
            .get("key.coercion")
            .map(|s| CoercionMode::from_str_config(s))
            .transpose()?
            .unwrap_or_default();

        let parsed = SinkConfig {
            table_name,
            endpoint: config.get("endpoint").cloned(),
            region: config.get("region").cloned(),
            credentials,
            proxy_uri: config.get("proxy.uri").cloned(),
            time_format: config.get("time.format").cloned(),
            localtime: parse_bool(config, "time.localtime")?.unwrap_or(false),
            time_field_enabled: parse_bool(config, "time.field.enabled")?.unwrap_or(true),
            write_mode: if delete_mode {
                WriteMode::Delete
            } else {
                WriteMode::Put
            },
            workers,
            limits,
            validation_policy,
            key_coercion,
        };

        // surface a bad time.format at load time
        parsed.time_formatter()?;

        Ok(parsed)
    }

    /// Build the time formatter this config describes.
    pub fn time_formatter(&self) -> Result<TimeFormatter> {
        TimeFormatter::new(self.time_format.as_deref(), self.localtime)
    }
}

fn parse_bool(config: &HashMap<String, String>, key: &str) -> Result<Option<bool>> {
    config
        .get(key)
        .map(|s| match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            other => Err(FlushError::Config(format!("invalid {}: '{}'", key, other))),
        })
        .transpose()
}

fn parse_usize(config: &HashMap<String, String>, key: &str) -> Result<Option<usize>> {
    config
        .get(key)
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| FlushError::Config(format!("invalid {}: {}", key, e)))
        })
        .transpose()
}
