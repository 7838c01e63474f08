//! The application's side of shard consumption.

use async_trait::async_trait;

use crate::checkpoint::ExtendedSequenceNumber;
use crate::checkpointer::RecordCheckpointer;
use crate::stream_reader::Record;

/// Why a consumer stopped delivering records for a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownReason {
    /// Graceful stop: caught up with the stream, worker shutdown or
    /// re-balance. The lease is released afterwards.
    Requested,
    /// Another worker owns the lease now. Checkpointing is refused.
    Zombie,
    /// The shard is closed and fully read. Its checkpoint is forced to the
    /// shard end so that it is never read again.
    Terminate,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Requested => "REQUESTED",
            Self::Zombie => "ZOMBIE",
            Self::Terminate => "TERMINATE",
        })
    }
}

#[derive(Debug, Clone)]
pub struct InitializationInput {
    pub shard_id: String,
    pub extended_sequence_number: ExtendedSequenceNumber,
}

pub struct RecordsInput<'a> {
    pub records: Vec<Record>,
    pub millis_behind_latest: i64,
    pub checkpointer: &'a RecordCheckpointer,
}

pub struct ShutdownInput<'a> {
    pub shard_id: String,
    pub shutdown_reason: ShutdownReason,
    pub checkpointer: &'a RecordCheckpointer,
}

/// Callbacks invoked by the consumer of a single shard, in order:
/// `initialize` once, `process_records` per batch, `shutdown` once.
///
/// Returning an error fails the shard's consumer task, and with it the
/// worker's consumption round.
#[async_trait]
pub trait RecordProcessor: Send {
    async fn initialize(&mut self, input: InitializationInput) -> anyhow::Result<()>;

    /// Records arrive in shard order. Checkpoint with
    /// `input.checkpointer` once they are safely handled.
    async fn process_records(&mut self, input: RecordsInput<'_>) -> anyhow::Result<()>;

    async fn shutdown(&mut self, input: ShutdownInput<'_>) -> anyhow::Result<()>;
}

/// Creates one processor per leased shard.
pub trait RecordProcessorFactory: Send + Sync {
    fn create_processor(&self) -> Box<dyn RecordProcessor>;
}

impl<F> RecordProcessorFactory for F
where
    F: Fn() -> Box<dyn RecordProcessor> + Send + Sync,
{
    fn create_processor(&self) -> Box<dyn RecordProcessor> {
        self()
    }
}
