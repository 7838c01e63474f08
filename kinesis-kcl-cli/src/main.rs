use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{ArgEnum, Parser};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kinesis_kcl::aws::kinesis::{self, KinesisStreamReader};
use kinesis_kcl::storage::{dynamo, DynamoLeaseStore, MemoryLeaseStore, PostgresLeaseStore};
use kinesis_kcl::{
    Config, InitializationInput, LeaseStore, RecordProcessor, RecordsInput, ShutdownInput,
    ShutdownReason, Worker,
};

#[derive(Parser)]
#[clap(name = "kinesis-kcl")]
#[clap(version = "0.1.0")]
#[clap(about = "Consume an Amazon Kinesis data stream with coordinated shard leases")]
#[clap(long_about = None)]
struct Args {
    /// JSON configuration file. Flags below override its values.
    #[clap(long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[clap(long)]
    stream_name: Option<String>,

    #[clap(long)]
    application_name: Option<String>,

    #[clap(long)]
    region: Option<String>,

    /// Defaults to a random id per process.
    #[clap(long)]
    worker_id: Option<String>,

    #[clap(arg_enum)]
    storage_backend: SupportedStorageBackend,

    #[clap(long, env = "POSTGRES_DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ArgEnum)]
enum SupportedStorageBackend {
    Memory,
    Postgres,
    Dynamodb,
}

/// Logs every record and checkpoints after each batch.
#[derive(Default)]
struct LoggingRecordProcessor {
    shard_id: String,
}

#[async_trait]
impl RecordProcessor for LoggingRecordProcessor {
    async fn initialize(&mut self, input: InitializationInput) -> anyhow::Result<()> {
        info!(
            shard_id = %input.shard_id,
            checkpoint = %input.extended_sequence_number,
            "initializing record processor"
        );
        self.shard_id = input.shard_id;
        Ok(())
    }

    async fn process_records(&mut self, input: RecordsInput<'_>) -> anyhow::Result<()> {
        for record in &input.records {
            info!(
                shard_id = %self.shard_id,
                sequence_number = %record.sequence_number,
                partition_key = %record.partition_key,
                data = %String::from_utf8_lossy(&record.data),
                "record"
            );
        }

        if let Some(last) = input.records.last() {
            input
                .checkpointer
                .update_checkpoint(Some(&last.sequence_number))
                .await?;
        }

        Ok(())
    }

    async fn shutdown(&mut self, input: ShutdownInput<'_>) -> anyhow::Result<()> {
        info!(shard_id = %input.shard_id, reason = %input.shutdown_reason, "shutting down");

        if input.shutdown_reason == ShutdownReason::Terminate {
            input.checkpointer.update_checkpoint(None).await?;
        }

        Ok(())
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("unable to read {}", path.display()))?;
            Config::from_json(&json)?
        }
        None => Config::default(),
    };

    if let Some(stream_name) = &args.stream_name {
        config.stream_name = stream_name.clone();
    }
    if let Some(application_name) = &args.application_name {
        config.application_name = application_name.clone();
    }
    if args.region.is_some() {
        config.region = args.region.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn lease_store(args: &Args, config: &Config) -> anyhow::Result<Arc<dyn LeaseStore>> {
    Ok(match args.storage_backend {
        SupportedStorageBackend::Memory => {
            warn!("leases are kept in memory and are not shared with other workers");
            Arc::new(MemoryLeaseStore::new())
        }
        SupportedStorageBackend::Postgres => {
            let database_url = args.database_url.clone().context(
                "the postgres backend needs `--database-url` or `POSTGRES_DATABASE_URL`",
            )?;
            let table = config.lease_table_name.as_str();
            let mut store = PostgresLeaseStore::new(database_url, table);
            store.init(PgPoolOptions::new()).await?;
            Arc::new(store)
        }
        SupportedStorageBackend::Dynamodb => {
            let client = dynamo::create_client(config.region.as_deref())?;
            let store = DynamoLeaseStore::new(client, config.lease_table_name.as_str())
                .with_capacity(
                    config.dynamodb_read_capacity,
                    config.dynamodb_write_capacity,
                );
            store.create_table_if_not_exists().await?;
            Arc::new(store)
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let store = lease_store(&args, &config).await?;

    let client = kinesis::create_client(config.region.as_deref())?;
    let reader = KinesisStreamReader::new(client, config.stream_name.as_str())
        .with_max_records(config.max_records);

    let worker_id = args
        .worker_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut worker = Worker::new(worker_id, config, reader, store, || {
        Box::new(LoggingRecordProcessor::default()) as Box<dyn RecordProcessor>
    });

    let trigger = worker.shutdown_trigger();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            trigger.shutdown();
        }
    });

    worker.run().await?;

    Ok(())
}
