pub mod dynamo;
pub mod memory;
pub mod postgres;

use crate::consumer::lease::ShardInfo;
use crate::error::Result;
use async_trait::async_trait;

pub use dynamo::DynamoLeaseStore;
pub use memory::MemoryLeaseStore;
pub use postgres::PostgresLeaseStore;

/// Durable lease records keyed by shard id.
///
/// Implementations must serialize concurrent writers: `update_lease` only
/// succeeds when the stored `lease_counter` still equals the caller's
/// expected value.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get_lease(&self, shard_id: &str) -> Result<Option<ShardInfo>>;

    /// Inserts `lease` unless a record for its shard exists. Returns whether
    /// the record was created.
    async fn create_lease_if_not_exists(&self, lease: &ShardInfo) -> Result<bool>;

    /// Replaces the stored record with `lease` if its counter equals
    /// `expected_counter`. Returns false when the condition fails or the
    /// record is missing.
    async fn update_lease(&self, lease: &ShardInfo, expected_counter: u64) -> Result<bool>;

    async fn list_leases(&self) -> Result<Vec<ShardInfo>>;
}
