//! Fakes shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::checkpoint::StartingPosition;
use crate::config::Config;
use crate::consumer::lease::ShardInfo;
use crate::error::{KclError, Result};
use crate::record_processor::{
    InitializationInput, RecordProcessor, RecordsInput, ShutdownInput, ShutdownReason,
};
use crate::storage::{LeaseStore, MemoryLeaseStore};
use crate::stream_reader::{GetRecordsOutput, Record, Shard, StreamReader};

pub(crate) const WORKER_ID: &str = "test-worker";

pub(crate) fn test_config() -> Config {
    let mut config = Config::new("test-app", "test-stream");
    config.idle_time_between_reads_ms = 0;
    config.shard_sync_interval_ms = 0;
    config
}

pub(crate) fn shard_id(n: usize) -> String {
    format!("shardId-{:012}", n)
}

/// One scripted answer to `get_records`.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Batch {
        sequence_numbers: Vec<String>,
        millis_behind_latest: i64,
        closed: bool,
    },
    Expired,
    Fail,
}

impl Step {
    pub(crate) fn batch(sequence_numbers: &[&str], millis_behind_latest: i64) -> Self {
        Self::Batch {
            sequence_numbers: sequence_numbers.iter().map(|s| s.to_string()).collect(),
            millis_behind_latest,
            closed: false,
        }
    }

    /// Final batch of a closed shard: no next iterator, zero lag.
    pub(crate) fn closed(sequence_numbers: &[&str]) -> Self {
        Self::Batch {
            sequence_numbers: sequence_numbers.iter().map(|s| s.to_string()).collect(),
            millis_behind_latest: 0,
            closed: true,
        }
    }
}

/// What `get_records` does once a shard's steps run out.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Drained {
    /// Never answers.
    Pending,
    /// Fails with an expired iterator every time.
    Expired,
    /// Empty batch with zero lag.
    CaughtUp,
    /// Empty batch while still behind the tip.
    Behind,
}

struct ShardScript {
    parent_shard_id: Option<String>,
    steps: VecDeque<Step>,
    drained: Drained,
}

#[derive(Default)]
struct ScriptState {
    shards: BTreeMap<String, ShardScript>,
    get_records_calls: BTreeMap<String, usize>,
    positions: BTreeMap<String, Vec<StartingPosition>>,
}

/// Stream reader that replays per-shard scripts.
#[derive(Clone, Default)]
pub(crate) struct ScriptedStream {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedStream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_shard(
        self,
        shard_id: &str,
        parent_shard_id: Option<&str>,
        steps: Vec<Step>,
        drained: Drained,
    ) -> Self {
        self.state.lock().unwrap().shards.insert(
            shard_id.to_string(),
            ShardScript {
                parent_shard_id: parent_shard_id.map(str::to_string),
                steps: steps.into(),
                drained,
            },
        );
        self
    }

    pub(crate) fn get_records_calls(&self, shard_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .get_records_calls
            .get(shard_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn positions(&self, shard_id: &str) -> Vec<StartingPosition> {
        self.state
            .lock()
            .unwrap()
            .positions
            .get(shard_id)
            .cloned()
            .unwrap_or_default()
    }

    fn next_step(&self, shard_id: &str) -> (Option<Step>, Drained) {
        let state = &mut *self.state.lock().unwrap();
        *state
            .get_records_calls
            .entry(shard_id.to_string())
            .or_default() += 1;

        match state.shards.get_mut(shard_id) {
            Some(script) => (script.steps.pop_front(), script.drained),
            None => (None, Drained::Pending),
        }
    }
}

fn records(sequence_numbers: &[String]) -> Vec<Record> {
    sequence_numbers
        .iter()
        .map(|sequence_number| Record {
            sequence_number: sequence_number.clone(),
            partition_key: "pk".to_string(),
            data: sequence_number.as_bytes().to_vec(),
            approximate_arrival_timestamp: None,
        })
        .collect()
}

fn expired() -> KclError {
    KclError::ExpiredIterator {
        message: "Iterator expired".to_string(),
    }
}

#[async_trait]
impl StreamReader for ScriptedStream {
    async fn list_shards(&self) -> Result<Vec<Shard>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .shards
            .iter()
            .map(|(shard_id, script)| Shard {
                shard_id: shard_id.clone(),
                parent_shard_id: script.parent_shard_id.clone(),
            })
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        shard_id: &str,
        position: &StartingPosition,
    ) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .positions
            .entry(shard_id.to_string())
            .or_default()
            .push(position.clone());

        Ok(format!("{}|start", shard_id))
    }

    async fn get_records(&self, shard_iterator: &str) -> Result<GetRecordsOutput> {
        tokio::task::yield_now().await;

        let shard_id = shard_iterator.split('|').next().unwrap_or_default().to_string();
        let next_iterator = Some(format!("{}|next", shard_id));
        let (step, drained) = self.next_step(&shard_id);

        match step {
            Some(Step::Batch {
                sequence_numbers,
                millis_behind_latest,
                closed,
            }) => Ok(GetRecordsOutput {
                records: records(&sequence_numbers),
                next_shard_iterator: if closed { None } else { next_iterator },
                millis_behind_latest,
            }),
            Some(Step::Expired) => Err(expired()),
            Some(Step::Fail) => Err(KclError::stream("get_records", "scripted failure")),
            None => match drained {
                Drained::Pending => futures::future::pending().await,
                Drained::Expired => Err(expired()),
                Drained::CaughtUp => Ok(GetRecordsOutput {
                    records: Vec::new(),
                    next_shard_iterator: next_iterator,
                    millis_behind_latest: 0,
                }),
                Drained::Behind => Ok(GetRecordsOutput {
                    records: Vec::new(),
                    next_shard_iterator: next_iterator,
                    millis_behind_latest: 1_000,
                }),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProcessorEvent {
    Initialized(String),
    Processed(Vec<String>),
    Shutdown(ShutdownReason),
}

#[derive(Clone, Default)]
pub(crate) struct ProcessorLog(Arc<Mutex<Vec<ProcessorEvent>>>);

impl ProcessorLog {
    pub(crate) fn events(&self) -> Vec<ProcessorEvent> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn processed(&self) -> Vec<Vec<String>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProcessorEvent::Processed(batch) => Some(batch),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ProcessorEvent) {
        self.0.lock().unwrap().push(event);
    }
}

/// Processor that records every callback and optionally checkpoints the
/// last record of each batch.
pub(crate) struct RecordingProcessor {
    pub(crate) log: ProcessorLog,
    pub(crate) checkpoint_batches: bool,
    pub(crate) fail_processing: bool,
}

impl RecordingProcessor {
    pub(crate) fn new(log: ProcessorLog) -> Self {
        Self {
            log,
            checkpoint_batches: false,
            fail_processing: false,
        }
    }

    pub(crate) fn checkpointing(log: ProcessorLog) -> Self {
        Self {
            checkpoint_batches: true,
            ..Self::new(log)
        }
    }
}

#[async_trait]
impl RecordProcessor for RecordingProcessor {
    async fn initialize(&mut self, input: InitializationInput) -> anyhow::Result<()> {
        self.log.push(ProcessorEvent::Initialized(input.shard_id));
        Ok(())
    }

    async fn process_records(&mut self, input: RecordsInput<'_>) -> anyhow::Result<()> {
        self.log.push(ProcessorEvent::Processed(
            input
                .records
                .iter()
                .map(|r| r.sequence_number.clone())
                .collect(),
        ));

        if self.fail_processing {
            anyhow::bail!("processing failed");
        }

        if self.checkpoint_batches {
            if let Some(last) = input.records.last() {
                input
                    .checkpointer
                    .update_checkpoint(Some(&last.sequence_number))
                    .await?;
            }
        }

        Ok(())
    }

    async fn shutdown(&mut self, input: ShutdownInput<'_>) -> anyhow::Result<()> {
        self.log.push(ProcessorEvent::Shutdown(input.shutdown_reason));
        Ok(())
    }
}

/// Memory store that counts lease acquisitions: writes handing the lease to
/// an owner different from the stored one.
#[derive(Clone, Default)]
pub(crate) struct RecordingStore {
    inner: MemoryLeaseStore,
    acquisitions: Arc<Mutex<usize>>,
}

impl RecordingStore {
    pub(crate) fn acquisitions(&self) -> usize {
        *self.acquisitions.lock().unwrap()
    }

    pub(crate) fn reset(&self) {
        *self.acquisitions.lock().unwrap() = 0;
    }
}

#[async_trait]
impl LeaseStore for RecordingStore {
    async fn get_lease(&self, shard_id: &str) -> Result<Option<ShardInfo>> {
        self.inner.get_lease(shard_id).await
    }

    async fn create_lease_if_not_exists(&self, lease: &ShardInfo) -> Result<bool> {
        self.inner.create_lease_if_not_exists(lease).await
    }

    async fn update_lease(&self, lease: &ShardInfo, expected_counter: u64) -> Result<bool> {
        let previous_owner = self
            .inner
            .get_lease(&lease.shard_id)
            .await?
            .and_then(|stored| stored.lease_owner);
        let updated = self.inner.update_lease(lease, expected_counter).await?;

        if updated && lease.lease_owner.is_some() && lease.lease_owner != previous_owner {
            *self.acquisitions.lock().unwrap() += 1;
        }

        Ok(updated)
    }

    async fn list_leases(&self) -> Result<Vec<ShardInfo>> {
        self.inner.list_leases().await
    }
}

#[derive(Debug, Default)]
struct CapturedEvent {
    message: String,
    shard_id: Option<String>,
}

/// Collects the message and `shard_id` field of every tracing event.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(Arc<Mutex<Vec<CapturedEvent>>>);

impl CapturedLogs {
    pub(crate) fn count(&self, needle: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.message.contains(needle))
            .count()
    }

    /// Sorted shard ids of the events whose message contains `needle`.
    pub(crate) fn shard_ids(&self, needle: &str) -> Vec<String> {
        let mut shard_ids: Vec<String> = self
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.message.contains(needle))
            .filter_map(|event| event.shard_id.clone())
            .collect();
        shard_ids.sort();
        shard_ids
    }
}

impl Visit for CapturedEvent {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "shard_id" => self.shard_id = Some(format!("{:?}", value)),
            _ => {}
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = CapturedEvent::default();
        event.record(&mut captured);
        self.0.lock().unwrap().push(captured);
    }
}

/// Routes this thread's tracing events into the returned log until the
/// guard is dropped. Pair with a current-thread runtime.
pub(crate) fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry().with(logs.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}
