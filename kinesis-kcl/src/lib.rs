pub mod aws;
pub mod checkpoint;
pub mod checkpointer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod record_processor;
pub mod storage;
pub mod stream_reader;
pub mod worker;

#[cfg(test)]
mod testing;

pub use checkpoint::{Checkpoint, ExtendedSequenceNumber, StartingPosition};
pub use checkpointer::{Checkpointer, RecordCheckpointer};
pub use config::Config;
pub use consumer::lease::ShardInfo;
pub use consumer::Consumer;
pub use error::{KclError, Result};
pub use record_processor::{
    InitializationInput, RecordProcessor, RecordProcessorFactory, RecordsInput, ShutdownInput,
    ShutdownReason,
};
pub use storage::LeaseStore;
pub use stream_reader::{GetRecordsOutput, Record, Shard, StreamReader};
pub use worker::{ShutdownTrigger, Worker};
