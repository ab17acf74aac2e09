//! DynamoDB executor.
//!
//! Sends batches through `BatchWriteItem` and reads key schemas through
//! `DescribeTable`. The client is owned by the executor and rebuilt from the
//! same `SdkConfig` on `reconnect`.
//!
//! This module is only available when the `dynamodb` feature is enabled.
//!
//! ## Error mapping
//!
//! | Store error                  | FlushError   |
//! |------------------------------|--------------|
//! | `ValidationException`        | `Validation` |
//! | anything else on write       | `Transport`  |
//! | items still unprocessed      | `Transport`  |
//! | `ResourceNotFoundException`  | `Config` (schema lookup) |

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_dynamodb::config::{Credentials as StaticCredentials, Region};
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, DeleteRequest, KeySchemaElement, KeyType, PutRequest,
    ScalarAttributeType, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use dynaflush_core::{
    FlushError, KeyAttribute, KeySchema, KeySchemaProvider, Record, Result, Scalar, SinkConfig,
    WriteExecutor,
};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

use crate::retry::{retry_with_backoff, RetryPolicy};

/// Write executor backed by a DynamoDB client.
pub struct DynamoDbExecutor {
    sdk_config: SdkConfig,
    client: RwLock<Client>,
    retry: RetryPolicy,
    schemas: Mutex<HashMap<String, KeySchema>>,
}

impl DynamoDbExecutor {
    /// Build a client from `config`.
    ///
    /// Region, endpoint and static credentials override the default provider
    /// chain when set. A proxy cannot be honoured by the default HTTP client
    /// and is refused.
    pub async fn connect(config: &SinkConfig, retry: RetryPolicy) -> Result<Self> {
        if let Some(proxy) = &config.proxy_uri {
            return Err(FlushError::Config(format!(
                "proxy.uri '{}' is not supported by the DynamoDB executor",
                proxy
            )));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let Some(credentials) = &config.credentials {
            loader = loader.credentials_provider(StaticCredentials::new(
                credentials.key_id.clone(),
                credentials.secret_key.clone(),
                None,
                None,
                "dynaflush",
            ));
        }

        let sdk_config = loader.load().await;
        let client = Client::new(&sdk_config);

        tracing::info!(
            table = %config.table_name,
            region = ?sdk_config.region(),
            endpoint = ?config.endpoint,
            "DynamoDB client ready"
        );

        Ok(Self {
            sdk_config,
            client: RwLock::new(client),
            retry,
            schemas: Mutex::new(HashMap::new()),
        })
    }

    async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    /// Send `requests`, resending whatever the store leaves unprocessed.
    async fn write(&self, table: &str, mut pending: Vec<WriteRequest>) -> Result<()> {
        let mut attempt = 0;

        loop {
            let output = self
                .client()
                .await
                .batch_write_item()
                .request_items(table, pending)
                .send()
                .await
                .map_err(|e| classify("BatchWriteItem", e))?;

            let unprocessed = output
                .unprocessed_items()
                .and_then(|items| items.get(table))
                .cloned()
                .unwrap_or_default();
            if unprocessed.is_empty() {
                return Ok(());
            }

            if attempt >= self.retry.max_retries {
                return Err(FlushError::Transport(format!(
                    "{} items still unprocessed after {} retries",
                    unprocessed.len(),
                    self.retry.max_retries
                )));
            }

            let backoff = self.retry.backoff(attempt);
            tracing::warn!(
                table,
                unprocessed = unprocessed.len(),
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                "resending unprocessed items"
            );
            sleep(backoff).await;
            attempt += 1;
            pending = unprocessed;
        }
    }

    async fn describe(&self, table: &str) -> Result<KeySchema> {
        let output = self
            .client()
            .await
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| {
                let missing = matches!(
                    e.as_service_error().and_then(|s| s.code()),
                    Some("ResourceNotFoundException")
                );
                if missing {
                    FlushError::Config(format!("table '{}' does not exist", table))
                } else {
                    classify("DescribeTable", e)
                }
            })?;

        let description = output.table().ok_or_else(|| {
            FlushError::Config(format!("DescribeTable returned no description for '{}'", table))
        })?;

        key_schema_from(description.key_schema(), description.attribute_definitions())
    }
}

#[async_trait]
impl WriteExecutor for DynamoDbExecutor {
    async fn put_batch(&self, table: &str, records: &[Record]) -> Result<()> {
        let requests = records
            .iter()
            .map(put_request)
            .collect::<Result<Vec<_>>>()?;
        self.write(table, requests).await
    }

    async fn delete_batch(&self, table: &str, records: &[Record]) -> Result<()> {
        let schema = self.key_schema(table).await?;
        let requests = records
            .iter()
            .map(|record| delete_request(&schema, record))
            .collect::<Result<Vec<_>>>()?;
        self.write(table, requests).await
    }

    async fn reconnect(&self) -> Result<()> {
        let fresh = Client::new(&self.sdk_config);
        *self.client.write().await = fresh;
        tracing::info!("DynamoDB client rebuilt");
        Ok(())
    }

    fn name(&self) -> &str {
        "dynamodb"
    }
}

#[async_trait]
impl KeySchemaProvider for DynamoDbExecutor {
    async fn key_schema(&self, table: &str) -> Result<KeySchema> {
        if let Some(schema) = self.schemas.lock().await.get(table) {
            return Ok(schema.clone());
        }

        let schema = retry_with_backoff(&self.retry, || self.describe(table)).await?;
        self.schemas
            .lock()
            .await
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }
}

fn classify<E>(operation: &str, err: SdkError<E>) -> FlushError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));
    match code.as_deref() {
        Some("ValidationException") => FlushError::Validation(message),
        _ => FlushError::Transport(message),
    }
}

fn key_schema_from(
    elements: &[KeySchemaElement],
    definitions: &[AttributeDefinition],
) -> Result<KeySchema> {
    let attribute = |name: &str| -> Result<KeyAttribute> {
        let definition = definitions
            .iter()
            .find(|d| d.attribute_name() == name)
            .ok_or_else(|| {
                FlushError::Config(format!("key attribute '{}' has no definition", name))
            })?;
        let scalar = match definition.attribute_type() {
            ScalarAttributeType::S => Scalar::String,
            ScalarAttributeType::N => Scalar::Number,
            other => {
                return Err(FlushError::Config(format!(
                    "key attribute '{}' has unsupported type {}",
                    name,
                    other.as_str()
                )))
            }
        };
        Ok(KeyAttribute::new(name, scalar))
    };

    let mut hash_key = None;
    let mut range_key = None;
    for element in elements {
        match element.key_type() {
            KeyType::Hash => hash_key = Some(attribute(element.attribute_name())?),
            KeyType::Range => range_key = Some(attribute(element.attribute_name())?),
            other => {
                return Err(FlushError::Config(format!(
                    "unknown key type {}",
                    other.as_str()
                )))
            }
        }
    }

    let hash_key =
        hash_key.ok_or_else(|| FlushError::Config("table has no hash key".to_string()))?;
    Ok(KeySchema {
        hash_key,
        range_key,
    })
}

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute).collect()),
        Value::Object(fields) => AttributeValue::M(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_attribute(v)))
                .collect(),
        ),
    }
}

fn to_item(record: &Record) -> HashMap<String, AttributeValue> {
    record
        .fields()
        .iter()
        .map(|(k, v)| (k.clone(), to_attribute(v)))
        .collect()
}

fn put_request(record: &Record) -> Result<WriteRequest> {
    let put = PutRequest::builder()
        .set_item(Some(to_item(record)))
        .build()
        .map_err(|e| FlushError::Serialization(format!("building put request: {}", e)))?;
    Ok(WriteRequest::builder().put_request(put).build())
}

fn delete_request(schema: &KeySchema, record: &Record) -> Result<WriteRequest> {
    let key: HashMap<String, AttributeValue> = schema
        .attributes()
        .filter_map(|attr| {
            record
                .get(&attr.name)
                .map(|v| (attr.name.clone(), to_attribute(v)))
        })
        .collect();
    let delete = DeleteRequest::builder()
        .set_key(Some(key))
        .build()
        .map_err(|e| FlushError::Serialization(format!("building delete request: {}", e)))?;
    Ok(WriteRequest::builder().delete_request(delete).build())
}
