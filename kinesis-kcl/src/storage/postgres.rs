use std::convert::TryFrom;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::LeaseStore;
use crate::checkpoint::Checkpoint;
use crate::consumer::lease::ShardInfo;
use crate::error::{KclError, Result};

#[derive(sqlx::FromRow)]
struct LeaseRow {
    shard_id: String,
    parent_shard_id: Option<String>,
    checkpoint: Option<String>,
    lease_owner: Option<String>,
    lease_counter: i64,
    lease_timeout: Option<i64>,
}

impl TryFrom<LeaseRow> for ShardInfo {
    type Error = KclError;

    fn try_from(row: LeaseRow) -> Result<Self> {
        Ok(Self {
            lease_counter: u64::try_from(row.lease_counter)
                .map_err(|e| KclError::store("decode lease_counter", e))?,
            shard_id: row.shard_id,
            parent_shard_id: row.parent_shard_id,
            checkpoint: row.checkpoint.as_deref().map(Checkpoint::parse),
            lease_owner: row.lease_owner,
            lease_timeout: row.lease_timeout,
        })
    }
}

fn counter_param(counter: u64) -> Result<i64> {
    i64::try_from(counter).map_err(|e| KclError::store("encode lease_counter", e))
}

/// Lease store backed by a PostgreSQL table, one row per shard.
#[derive(Clone)]
pub struct PostgresLeaseStore {
    database_url: String,
    table_name: String,
    pool: Option<PgPool>,
}

impl PostgresLeaseStore {
    pub fn new(database_url: String, table_name: impl Into<String>) -> Self {
        Self {
            database_url,
            table_name: table_name.into(),
            pool: None,
        }
    }

    /// Connects and creates the lease table when it does not exist yet.
    pub async fn init(&mut self, options: PgPoolOptions) -> Result<()> {
        if !is_valid_table_name(&self.table_name) {
            return Err(KclError::Config {
                message: format!("invalid lease table name {:?}", self.table_name),
            });
        }

        let pool = options
            .connect(self.database_url.as_str())
            .await
            .map_err(|e| KclError::store("connect", e))?;

        sqlx::query(
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
              shard_id            VARCHAR(255) NOT NULL PRIMARY KEY,
              parent_shard_id     VARCHAR(255) DEFAULT NULL,
              checkpoint          VARCHAR(255) DEFAULT NULL,
              lease_owner         VARCHAR(255) DEFAULT NULL,
              lease_counter       BIGINT NOT NULL DEFAULT 0,
              lease_timeout       BIGINT DEFAULT NULL
            )",
                self.table_name
            )
            .as_str(),
        )
        .execute(&pool)
        .await
        .map_err(|e| KclError::store("create table", e))?;

        self.pool = Some(pool);

        Ok(())
    }

    fn pool(&self, operation: &'static str) -> Result<&PgPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| KclError::store(operation, "postgres lease store is not initialized"))
    }
}

fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn get_lease(&self, shard_id: &str) -> Result<Option<ShardInfo>> {
        let row: Option<LeaseRow> = sqlx::query_as(
            format!("SELECT * FROM {} WHERE shard_id = $1", self.table_name).as_str(),
        )
        .bind(shard_id)
        .fetch_optional(self.pool("get_lease")?)
        .await
        .map_err(|e| KclError::store("get_lease", e))?;

        row.map(ShardInfo::try_from).transpose()
    }

    async fn create_lease_if_not_exists(&self, lease: &ShardInfo) -> Result<bool> {
        let created = sqlx::query(
            format!(
                "INSERT INTO {}
                (shard_id, parent_shard_id, checkpoint, lease_owner, lease_counter, lease_timeout)
                VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
                self.table_name
            )
            .as_str(),
        )
        .bind(&lease.shard_id)
        .bind(&lease.parent_shard_id)
        .bind(lease.checkpoint.as_ref().map(|c| c.to_string()))
        .bind(&lease.lease_owner)
        .bind(counter_param(lease.lease_counter)?)
        .bind(lease.lease_timeout)
        .execute(self.pool("create_lease_if_not_exists")?)
        .await
        .map_err(|e| KclError::store("create_lease_if_not_exists", e))?
        .rows_affected();

        Ok(created == 1)
    }

    async fn update_lease(&self, lease: &ShardInfo, expected_counter: u64) -> Result<bool> {
        let updated = sqlx::query(
            format!(
                "UPDATE {} SET parent_shard_id = $2, checkpoint = $3, lease_owner = $4,
                lease_counter = $5, lease_timeout = $6
                WHERE shard_id = $1 AND lease_counter = $7",
                self.table_name
            )
            .as_str(),
        )
        .bind(&lease.shard_id)
        .bind(&lease.parent_shard_id)
        .bind(lease.checkpoint.as_ref().map(|c| c.to_string()))
        .bind(&lease.lease_owner)
        .bind(counter_param(lease.lease_counter)?)
        .bind(lease.lease_timeout)
        .bind(counter_param(expected_counter)?)
        .execute(self.pool("update_lease")?)
        .await
        .map_err(|e| KclError::store("update_lease", e))?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn list_leases(&self) -> Result<Vec<ShardInfo>> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            format!("SELECT * FROM {} ORDER BY shard_id", self.table_name).as_str(),
        )
        .fetch_all(self.pool("list_leases")?)
        .await
        .map_err(|e| KclError::store("list_leases", e))?;

        rows.into_iter().map(ShardInfo::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(is_valid_table_name("kinesis_kcl_leases"));
        assert!(!is_valid_table_name("leases; DROP TABLE users"));
        assert!(!is_valid_table_name(""));
    }

    #[test]
    fn test_row_conversion() {
        let row = LeaseRow {
            shard_id: "shardId-000000000001".into(),
            parent_shard_id: Some("shardId-000000000000".into()),
            checkpoint: Some("SHARD_END".into()),
            lease_owner: None,
            lease_counter: 4,
            lease_timeout: None,
        };

        let shard = ShardInfo::try_from(row).unwrap();
        assert!(shard.is_completed());
        assert_eq!(shard.lease_counter, 4);
        assert_eq!(shard.parent_shard_id.as_deref(), Some("shardId-000000000000"));
    }

    #[tokio::test]
    async fn test_uninitialized_store_reports_error() {
        let store = PostgresLeaseStore::new("postgres://localhost/kcl".into(), "leases");

        assert!(matches!(
            store.get_lease("shardId-000000000000").await,
            Err(KclError::Store { .. })
        ));
    }
}
