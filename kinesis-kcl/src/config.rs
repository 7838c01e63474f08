use std::time::Duration;

use serde::Deserialize;

use crate::error::{KclError, Result};

/// Retries allowed for a read that failed with an expired iterator.
pub const DEFAULT_EXPIRED_ITERATOR_RETRIES: usize = 3;

/// Settings shared by the worker, its consumers and the checkpointer.
///
/// Constructed once by the caller and handed to every component; nothing in
/// the library reads configuration from the environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub application_name: String,
    pub stream_name: String,
    /// AWS region name. Falls back to the rusoto default chain when unset.
    pub region: Option<String>,
    pub lease_table_name: String,
    /// Maximum records requested per `GetRecords` call.
    pub max_records: i64,
    /// Upper bound on shards leased by one worker in a single round.
    pub max_leases_per_worker: Option<usize>,
    pub idle_time_between_reads_ms: u64,
    pub shard_sync_interval_ms: u64,
    pub expired_iterator_retries: usize,
    /// Lease lifetime. Leases never expire on their own when unset.
    pub lease_duration_ms: Option<u64>,
    pub dynamodb_read_capacity: i64,
    pub dynamodb_write_capacity: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application_name: env!("CARGO_PKG_NAME").to_string(),
            stream_name: String::new(),
            region: None,
            lease_table_name: "kinesis_kcl_leases".to_string(),
            max_records: 10_000,
            max_leases_per_worker: None,
            idle_time_between_reads_ms: 1_000,
            shard_sync_interval_ms: 10_000,
            expired_iterator_retries: DEFAULT_EXPIRED_ITERATOR_RETRIES,
            lease_duration_ms: None,
            dynamodb_read_capacity: 10,
            dynamodb_write_capacity: 10,
        }
    }
}

impl Config {
    pub fn new(application_name: impl Into<String>, stream_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            stream_name: stream_name.into(),
            ..Self::default()
        }
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| KclError::Config {
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(KclError::Config {
                message: message.to_string(),
            })
        };

        if self.stream_name.is_empty() {
            return invalid("stream_name must not be empty");
        }
        if self.lease_table_name.is_empty() {
            return invalid("lease_table_name must not be empty");
        }
        if self.max_records <= 0 {
            return invalid("max_records must be positive");
        }
        if self.max_leases_per_worker == Some(0) {
            return invalid("max_leases_per_worker must be positive when set");
        }

        Ok(())
    }

    pub fn idle_time_between_reads(&self) -> Duration {
        Duration::from_millis(self.idle_time_between_reads_ms)
    }

    pub fn shard_sync_interval(&self) -> Duration {
        Duration::from_millis(self.shard_sync_interval_ms)
    }

    pub fn lease_duration(&self) -> Option<Duration> {
        self.lease_duration_ms.map(Duration::from_millis)
    }
}
