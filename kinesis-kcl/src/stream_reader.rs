//! Read access to the shards of one stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::StartingPosition;
use crate::error::Result;

/// A shard as listed by the stream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
}

/// One data record pulled from a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Vec<u8>,
    pub approximate_arrival_timestamp: Option<DateTime<Utc>>,
}

/// A batch pulled with one shard iterator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetRecordsOutput {
    pub records: Vec<Record>,
    /// Iterator for the next read. `None` once a closed shard is exhausted.
    pub next_shard_iterator: Option<String>,
    pub millis_behind_latest: i64,
}

/// Stream service operations used by the worker and its consumers.
///
/// Implementations report a stale iterator as
/// [`KclError::ExpiredIterator`](crate::KclError::ExpiredIterator) so that
/// consumers can reposition and retry.
#[async_trait]
pub trait StreamReader: Send + Sync {
    async fn list_shards(&self) -> Result<Vec<Shard>>;

    async fn get_shard_iterator(
        &self,
        shard_id: &str,
        position: &StartingPosition,
    ) -> Result<String>;

    async fn get_records(&self, shard_iterator: &str) -> Result<GetRecordsOutput>;
}
