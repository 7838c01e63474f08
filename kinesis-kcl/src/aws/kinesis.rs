use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusoto_core::RusotoError;
use rusoto_kinesis::{
    GetRecordsError, GetRecordsInput, GetShardIteratorInput, Kinesis, KinesisClient,
    ListShardsInput,
};

use crate::checkpoint::StartingPosition;
use crate::error::{KclError, Result};
use crate::stream_reader::{GetRecordsOutput, Record, Shard, StreamReader};

pub fn create_client(region: Option<&str>) -> Result<KinesisClient> {
    Ok(KinesisClient::new(super::region(region)?))
}

pub async fn list_shards(
    client: &KinesisClient,
    stream_name: String,
) -> Result<Vec<rusoto_kinesis::Shard>> {
    let mut next_token: Option<String> = None;
    let mut all_shards = Vec::new();

    loop {
        // `StreamName` and `NextToken` are mutually exclusive
        let input = ListShardsInput {
            stream_name: next_token.is_none().then(|| stream_name.clone()),
            next_token,
            ..Default::default()
        };
        let output = client
            .list_shards(input)
            .await
            .map_err(|e| KclError::stream("list_shards", e))?;

        if let Some(shards) = output.shards {
            all_shards.extend(shards);
        }

        if output.next_token.is_some() {
            next_token = output.next_token;
        } else {
            break Ok(all_shards);
        }
    }
}

pub async fn get_shard_iterator(
    client: &KinesisClient,
    stream_name: String,
    shard_id: String,
    position: &StartingPosition,
) -> Result<String> {
    let input = GetShardIteratorInput {
        shard_id,
        shard_iterator_type: position.iterator_type().to_string(),
        starting_sequence_number: position.sequence_number().map(str::to_string),
        stream_name,
        ..Default::default()
    };

    client
        .get_shard_iterator(input)
        .await
        .map_err(|e| KclError::stream("get_shard_iterator", e))?
        .shard_iterator
        .ok_or_else(|| KclError::stream("get_shard_iterator", "no shard iterator returned"))
}

pub async fn get_records(
    client: &KinesisClient,
    shard_iterator: String,
    limit: Option<i64>,
) -> Result<GetRecordsOutput> {
    let input = GetRecordsInput {
        limit,
        shard_iterator,
        ..Default::default()
    };

    match client.get_records(input).await {
        Ok(output) => Ok(GetRecordsOutput {
            records: output.records.into_iter().map(Record::from).collect(),
            next_shard_iterator: output.next_shard_iterator,
            millis_behind_latest: output.millis_behind_latest.unwrap_or(0),
        }),
        Err(RusotoError::Service(GetRecordsError::ExpiredIterator(message))) => {
            Err(KclError::ExpiredIterator { message })
        }
        Err(e) => Err(KclError::stream("get_records", e)),
    }
}

impl From<rusoto_kinesis::Record> for Record {
    fn from(record: rusoto_kinesis::Record) -> Self {
        Self {
            sequence_number: record.sequence_number,
            partition_key: record.partition_key,
            data: record.data.into_iter().collect(),
            approximate_arrival_timestamp: record
                .approximate_arrival_timestamp
                .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()),
        }
    }
}

/// [`StreamReader`] over the Kinesis API for a single stream.
#[derive(Clone)]
pub struct KinesisStreamReader {
    client: KinesisClient,
    stream_name: String,
    max_records: Option<i64>,
}

impl KinesisStreamReader {
    pub fn new(client: KinesisClient, stream_name: impl Into<String>) -> Self {
        Self {
            client,
            stream_name: stream_name.into(),
            max_records: None,
        }
    }

    pub fn with_max_records(mut self, max_records: i64) -> Self {
        self.max_records = Some(max_records);
        self
    }
}

#[async_trait]
impl StreamReader for KinesisStreamReader {
    async fn list_shards(&self) -> Result<Vec<Shard>> {
        Ok(list_shards(&self.client, self.stream_name.clone())
            .await?
            .into_iter()
            .map(|s| Shard {
                shard_id: s.shard_id,
                parent_shard_id: s.parent_shard_id,
            })
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        shard_id: &str,
        position: &StartingPosition,
    ) -> Result<String> {
        get_shard_iterator(
            &self.client,
            self.stream_name.clone(),
            shard_id.to_owned(),
            position,
        )
        .await
    }

    async fn get_records(&self, shard_iterator: &str) -> Result<GetRecordsOutput> {
        get_records(&self.client, shard_iterator.to_owned(), self.max_records).await
    }
}
