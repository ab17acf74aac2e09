//! dynaflush binary
//!
//! Reads newline-delimited JSON records from stdin and writes them to a
//! DynamoDB table in store-compliant batches.
//!
//! Every option can also be given through its `DYNAFLUSH_*` environment
//! variable. Log verbosity follows `RUST_LOG` (default `info`).
//!
//! # Example
//!
//! ```bash
//! export DYNAFLUSH_TABLE=app-logs
//! export DYNAFLUSH_REGION=eu-west-1
//! tail -F app.log.json | dynaflush --workers 4
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dynaflush_connector::{
    pump, DynamoDbExecutor, NdjsonSource, RetryPolicy, SourceConfig, WorkerPool,
};
use dynaflush_core::{FlushController, SinkConfig};
use tokio::io::BufReader;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "dynaflush")]
#[command(about = "Batch NDJSON records from stdin into a DynamoDB table", long_about = None)]
struct Cli {
    /// Target table
    #[arg(short, long, env = "DYNAFLUSH_TABLE")]
    table: String,

    /// Store endpoint URL (e.g. a local DynamoDB)
    #[arg(long, env = "DYNAFLUSH_ENDPOINT")]
    endpoint: Option<String>,

    /// Store region
    #[arg(long, env = "DYNAFLUSH_REGION")]
    region: Option<String>,

    /// Static access key id
    #[arg(long, env = "DYNAFLUSH_AWS_KEY_ID")]
    aws_key_id: Option<String>,

    /// Static secret key
    #[arg(long, env = "DYNAFLUSH_AWS_SECRET_KEY", hide_env_values = true)]
    aws_secret_key: Option<String>,

    /// Outbound proxy URI
    #[arg(long, env = "DYNAFLUSH_PROXY_URI")]
    proxy_uri: Option<String>,

    /// strftime format for the derived time string
    #[arg(long, env = "DYNAFLUSH_TIME_FORMAT")]
    time_format: Option<String>,

    /// Render times in the local timezone
    #[arg(long, env = "DYNAFLUSH_LOCALTIME")]
    localtime: Option<String>,

    /// Stamp every record with a `time` field
    #[arg(long, env = "DYNAFLUSH_TIME_FIELD_ENABLED")]
    time_field_enabled: Option<String>,

    /// Dispatch batches as deletes instead of puts
    #[arg(long, env = "DYNAFLUSH_DELETE_MODE")]
    delete_mode: Option<String>,

    /// Number of flush workers
    #[arg(short, long, env = "DYNAFLUSH_WORKERS")]
    workers: Option<String>,

    /// Items per batch (at most 25)
    #[arg(long, env = "DYNAFLUSH_BATCH_MAX_ITEMS")]
    batch_max_items: Option<String>,

    /// Bytes per batch (at most 1048576)
    #[arg(long, env = "DYNAFLUSH_BATCH_MAX_BYTES")]
    batch_max_bytes: Option<String>,

    /// drop_batch, drop_unit or fail_unit
    #[arg(long, env = "DYNAFLUSH_VALIDATION_POLICY")]
    validation_policy: Option<String>,

    /// lenient or strict
    #[arg(long, env = "DYNAFLUSH_KEY_COERCION")]
    key_coercion: Option<String>,

    /// Records per delivery unit
    #[arg(long, env = "DYNAFLUSH_UNIT_MAX_RECORDS")]
    unit_max_records: Option<String>,

    /// Field holding the event time in epoch seconds
    #[arg(long, env = "DYNAFLUSH_TIME_KEY")]
    time_key: Option<String>,

    /// Redeliveries of a failed unit before it is given up
    #[arg(long, env = "DYNAFLUSH_MAX_RETRIES", default_value = "5")]
    max_retries: usize,

    /// Units queued ahead of the workers
    #[arg(long, env = "DYNAFLUSH_QUEUE_CAPACITY", default_value = "64")]
    queue_capacity: usize,
}

impl Cli {
    fn config_map(&self) -> HashMap<String, String> {
        let entries = [
            ("table.name", Some(&self.table)),
            ("endpoint", self.endpoint.as_ref()),
            ("region", self.region.as_ref()),
            ("aws.key_id", self.aws_key_id.as_ref()),
            ("aws.secret_key", self.aws_secret_key.as_ref()),
            ("proxy.uri", self.proxy_uri.as_ref()),
            ("time.format", self.time_format.as_ref()),
            ("time.localtime", self.localtime.as_ref()),
            ("time.field.enabled", self.time_field_enabled.as_ref()),
            ("delete.mode", self.delete_mode.as_ref()),
            ("workers", self.workers.as_ref()),
            ("batch.max_items", self.batch_max_items.as_ref()),
            ("batch.max_bytes", self.batch_max_bytes.as_ref()),
            ("validation.policy", self.validation_policy.as_ref()),
            ("key.coercion", self.key_coercion.as_ref()),
            ("unit.max_records", self.unit_max_records.as_ref()),
            ("time.key", self.time_key.as_ref()),
        ];

        entries
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), v.clone())))
            .collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let config_map = cli.config_map();

    let sink_config =
        SinkConfig::from_config_map(&config_map).context("invalid sink configuration")?;
    let source_config =
        SourceConfig::from_config_map(&config_map).context("invalid source configuration")?;
    let retry = RetryPolicy {
        max_retries: cli.max_retries,
        ..RetryPolicy::default()
    };

    info!(
        table = %sink_config.table_name,
        workers = sink_config.workers,
        mode = %sink_config.write_mode,
        policy = %sink_config.validation_policy,
        "dynaflush starting"
    );

    let executor = Arc::new(
        DynamoDbExecutor::connect(&sink_config, retry.clone())
            .await
            .context("failed to build DynamoDB client")?,
    );

    let initialized = FlushController::initialize(&sink_config, &*executor, executor.clone()).await;
    let controller = match initialized {
        Ok(controller) => controller,
        Err(e) => {
            error!(
                table = %sink_config.table_name,
                error = %e,
                "cannot start: table key schema unavailable"
            );
            return Err(e).context(format!(
                "failed to initialize table '{}'",
                sink_config.table_name
            ));
        }
    };

    let pool = WorkerPool::spawn(controller, sink_config.workers, retry, cli.queue_capacity);
    let mut source = NdjsonSource::new(BufReader::new(tokio::io::stdin()), source_config);

    let pumped = pump(&mut source, &pool).await;
    let stats = pool.shutdown().await;
    let units = pumped.context("reading stdin")?;

    info!(
        units,
        units_ok = stats.units_ok,
        units_failed = stats.units_failed,
        units_abandoned = stats.units_abandoned,
        "dynaflush finished"
    );

    if stats.units_abandoned > 0 {
        anyhow::bail!("{} delivery units were given up", stats.units_abandoned);
    }
    Ok(())
}
