use std::collections::HashMap;

use async_trait::async_trait;
use rusoto_core::RusotoError;
use rusoto_dynamodb::{
    AttributeDefinition, AttributeValue, CreateTableInput, DescribeTableError,
    DescribeTableInput, DynamoDb, DynamoDbClient, GetItemInput, KeySchemaElement,
    ProvisionedThroughput, PutItemError, PutItemInput, ScanInput,
};
use tracing::info;

use super::LeaseStore;
use crate::checkpoint::Checkpoint;
use crate::consumer::lease::ShardInfo;
use crate::error::{KclError, Result};

const SHARD_ID: &str = "shard_id";
const PARENT_SHARD_ID: &str = "parent_shard_id";
const CHECKPOINT: &str = "checkpoint";
const LEASE_OWNER: &str = "lease_owner";
const LEASE_COUNTER: &str = "lease_counter";
const LEASE_TIMEOUT: &str = "lease_timeout";

/// Lease store backed by a DynamoDB table keyed by `shard_id`.
#[derive(Clone)]
pub struct DynamoLeaseStore {
    client: DynamoDbClient,
    table_name: String,
    read_capacity: i64,
    write_capacity: i64,
}

pub fn create_client(region: Option<&str>) -> Result<DynamoDbClient> {
    Ok(DynamoDbClient::new(crate::aws::region(region)?))
}

impl DynamoLeaseStore {
    pub fn new(client: DynamoDbClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            read_capacity: 10,
            write_capacity: 10,
        }
    }

    pub fn with_capacity(mut self, read_capacity: i64, write_capacity: i64) -> Self {
        self.read_capacity = read_capacity;
        self.write_capacity = write_capacity;
        self
    }

    async fn table_exists(&self) -> Result<bool> {
        match self
            .client
            .describe_table(DescribeTableInput {
                table_name: self.table_name.clone(),
            })
            .await
        {
            Ok(output) => Ok(output.table.is_some()),
            Err(RusotoError::Service(DescribeTableError::ResourceNotFound(_))) => Ok(false),
            Err(e) => Err(KclError::store("describe_table", e)),
        }
    }

    fn create_table_input(&self) -> CreateTableInput {
        CreateTableInput {
            attribute_definitions: vec![AttributeDefinition {
                attribute_name: SHARD_ID.to_string(),
                attribute_type: "S".to_string(),
            }],
            table_name: self.table_name.clone(),
            key_schema: vec![KeySchemaElement {
                attribute_name: SHARD_ID.to_string(),
                key_type: "HASH".to_string(),
            }],
            provisioned_throughput: Some(ProvisionedThroughput {
                read_capacity_units: self.read_capacity,
                write_capacity_units: self.write_capacity,
            }),
            ..Default::default()
        }
    }

    pub async fn create_table_if_not_exists(&self) -> Result<()> {
        if self.table_exists().await? {
            info!(table = %self.table_name, "lease table already exists");
            return Ok(());
        }

        self.client
            .create_table(self.create_table_input())
            .await
            .map_err(|e| KclError::store("create_table", e))?;

        info!(table = %self.table_name, "created lease table");

        Ok(())
    }

    async fn conditional_put(
        &self,
        operation: &'static str,
        lease: &ShardInfo,
        condition_expression: &str,
        expression_attribute_values: Option<HashMap<String, AttributeValue>>,
    ) -> Result<bool> {
        let input = PutItemInput {
            table_name: self.table_name.clone(),
            item: to_item(lease),
            condition_expression: Some(condition_expression.to_string()),
            expression_attribute_values,
            ..Default::default()
        };

        match self.client.put_item(input).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(PutItemError::ConditionalCheckFailed(_))) => Ok(false),
            Err(e) => Err(KclError::store(operation, e)),
        }
    }
}

fn string_value(value: &str) -> AttributeValue {
    AttributeValue {
        s: Some(value.to_string()),
        ..Default::default()
    }
}

fn number_value(value: impl ToString) -> AttributeValue {
    AttributeValue {
        n: Some(value.to_string()),
        ..Default::default()
    }
}

fn to_item(lease: &ShardInfo) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();

    item.insert(SHARD_ID.to_string(), string_value(&lease.shard_id));
    item.insert(LEASE_COUNTER.to_string(), number_value(lease.lease_counter));

    if let Some(parent) = &lease.parent_shard_id {
        item.insert(PARENT_SHARD_ID.to_string(), string_value(parent));
    }
    if let Some(checkpoint) = &lease.checkpoint {
        item.insert(CHECKPOINT.to_string(), string_value(checkpoint.as_str()));
    }
    if let Some(owner) = &lease.lease_owner {
        item.insert(LEASE_OWNER.to_string(), string_value(owner));
    }
    if let Some(timeout) = lease.lease_timeout {
        item.insert(LEASE_TIMEOUT.to_string(), number_value(timeout));
    }

    item
}

fn from_item(item: &HashMap<String, AttributeValue>) -> Result<ShardInfo> {
    let string = |name: &str| item.get(name).and_then(|v| v.s.clone());
    let number = |name: &str| item.get(name).and_then(|v| v.n.clone());

    let shard_id = string(SHARD_ID)
        .ok_or_else(|| KclError::store("decode lease", "item has no shard_id"))?;
    let lease_counter = match number(LEASE_COUNTER) {
        Some(n) => n
            .parse::<u64>()
            .map_err(|e| KclError::store("decode lease_counter", e))?,
        None => 0,
    };
    let lease_timeout = number(LEASE_TIMEOUT)
        .map(|n| n.parse::<i64>())
        .transpose()
        .map_err(|e| KclError::store("decode lease_timeout", e))?;

    Ok(ShardInfo {
        shard_id,
        parent_shard_id: string(PARENT_SHARD_ID),
        checkpoint: string(CHECKPOINT).as_deref().map(Checkpoint::parse),
        lease_owner: string(LEASE_OWNER),
        lease_counter,
        lease_timeout,
    })
}

#[async_trait]
impl LeaseStore for DynamoLeaseStore {
    async fn get_lease(&self, shard_id: &str) -> Result<Option<ShardInfo>> {
        let mut key = HashMap::new();
        key.insert(SHARD_ID.to_string(), string_value(shard_id));

        let output = self
            .client
            .get_item(GetItemInput {
                table_name: self.table_name.clone(),
                key,
                consistent_read: Some(true),
                ..Default::default()
            })
            .await
            .map_err(|e| KclError::store("get_lease", e))?;

        output.item.as_ref().map(from_item).transpose()
    }

    async fn create_lease_if_not_exists(&self, lease: &ShardInfo) -> Result<bool> {
        self.conditional_put(
            "create_lease_if_not_exists",
            lease,
            "attribute_not_exists(shard_id)",
            None,
        )
        .await
    }

    async fn update_lease(&self, lease: &ShardInfo, expected_counter: u64) -> Result<bool> {
        let mut values = HashMap::new();
        values.insert(":expected".to_string(), number_value(expected_counter));

        self.conditional_put(
            "update_lease",
            lease,
            "attribute_exists(shard_id) AND lease_counter = :expected",
            Some(values),
        )
        .await
    }

    async fn list_leases(&self) -> Result<Vec<ShardInfo>> {
        let mut leases = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let output = self
                .client
                .scan(ScanInput {
                    table_name: self.table_name.clone(),
                    consistent_read: Some(true),
                    exclusive_start_key,
                    ..Default::default()
                })
                .await
                .map_err(|e| KclError::store("list_leases", e))?;

            for item in output.items.unwrap_or_default().iter() {
                leases.push(from_item(item)?);
            }

            match output.last_evaluated_key {
                Some(key) if !key.is_empty() => exclusive_start_key = Some(key),
                _ => break Ok(leases),
            }
        }
    }
}
