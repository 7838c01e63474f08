//! Pull loop for a single leased shard.

pub mod lease;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checkpointer::{Checkpointer, RecordCheckpointer};
use crate::config::Config;
use crate::error::{KclError, Result};
use crate::record_processor::{
    InitializationInput, RecordProcessor, RecordsInput, ShutdownInput, ShutdownReason,
};
use crate::stream_reader::{GetRecordsOutput, Record, StreamReader};

use self::lease::ShardInfo;

/// Reads one shard on behalf of the worker that leased it and feeds the
/// records to a [`RecordProcessor`].
pub struct Consumer<R> {
    shard: ShardInfo,
    processor: Box<dyn RecordProcessor>,
    stream_reader: R,
    checkpointer: Checkpointer,
    config: Arc<Config>,
    shutdown: watch::Receiver<bool>,
    /// Sequence numbers of the previous raw batch.
    last_sequence_numbers: HashSet<String>,
    last_renewed: Instant,
}

fn processor_error(shard_id: &str, source: anyhow::Error) -> KclError {
    KclError::Processor {
        shard_id: shard_id.to_string(),
        source,
    }
}

impl<R: StreamReader> Consumer<R> {
    /// `shard` must already be leased by the caller.
    pub fn new(
        shard: ShardInfo,
        processor: Box<dyn RecordProcessor>,
        stream_reader: R,
        checkpointer: Checkpointer,
        config: Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shard,
            processor,
            stream_reader,
            checkpointer,
            config,
            shutdown,
            last_sequence_numbers: HashSet::new(),
            last_renewed: Instant::now(),
        }
    }

    /// Latest lease state known to this consumer.
    pub fn shard(&self) -> &ShardInfo {
        &self.shard
    }

    /// Runs the processor over the shard until the shard ends, the consumer
    /// catches up with the stream, or shutdown is requested.
    ///
    /// Losing the lease shuts the processor down as a zombie and returns
    /// [`KclError::LeaseLost`].
    pub async fn consume(&mut self) -> Result<ShutdownReason> {
        info!(shard_id = %self.shard.shard_id, "consuming shard");

        let input = InitializationInput {
            shard_id: self.shard.shard_id.clone(),
            extended_sequence_number: self.shard.extended_sequence_number(),
        };
        self.processor
            .initialize(input)
            .await
            .map_err(|e| processor_error(&self.shard.shard_id, e))?;

        let reason = match self.read_shard().await {
            Ok(reason) => reason,
            Err(e) if e.is_lease_lost() => {
                warn!(shard_id = %self.shard.shard_id, "lease lost while consuming shard");
                if let Err(shutdown_err) = self.shutdown_processor(ShutdownReason::Zombie).await {
                    warn!(
                        shard_id = %self.shard.shard_id,
                        error = %shutdown_err,
                        "record processor failed to shut down"
                    );
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.shutdown_processor(reason).await?;

        Ok(reason)
    }

    async fn read_shard(&mut self) -> Result<ShutdownReason> {
        let mut shard_iterator = match self.start_shard_iterator().await? {
            Some(shard_iterator) => shard_iterator,
            None => {
                debug!(shard_id = %self.shard.shard_id, "shard already completed");
                return Ok(ShutdownReason::Terminate);
            }
        };
        let checkpointer = RecordCheckpointer::new(self.shard.clone(), self.checkpointer.clone());

        loop {
            let requested = *self.shutdown.borrow();
            if requested {
                debug!(shard_id = %self.shard.shard_id, "shutdown requested");
                return Ok(ShutdownReason::Requested);
            }

            let GetRecordsOutput {
                records,
                next_shard_iterator,
                millis_behind_latest,
            } = self.safe_get_records(shard_iterator).await?;

            let fetched: HashSet<String> = records
                .iter()
                .map(|r| r.sequence_number.clone())
                .collect();
            let caught_up = records.is_empty() && millis_behind_latest == 0;
            let records = self.unseen(records);

            debug!(
                shard_id = %self.shard.shard_id,
                records = records.len(),
                millis_behind_latest,
                "processing records"
            );

            self.processor
                .process_records(RecordsInput {
                    records,
                    millis_behind_latest,
                    checkpointer: &checkpointer,
                })
                .await
                .map_err(|e| processor_error(&self.shard.shard_id, e))?;

            shard_iterator = match next_shard_iterator {
                Some(next) => next,
                None => return Ok(ShutdownReason::Terminate),
            };
            if caught_up {
                return Ok(ShutdownReason::Requested);
            }

            let idle = fetched.is_empty();
            self.last_sequence_numbers = fetched;
            self.renew_lease_if_due().await?;

            if idle {
                let idle_time = self.config.idle_time_between_reads();
                tokio::select! {
                    _ = tokio::time::sleep(idle_time) => {}
                    _ = self.shutdown.changed() => {}
                }
            }
        }
    }

    /// Drops records already delivered with the previous batch.
    fn unseen(&self, records: Vec<Record>) -> Vec<Record> {
        if self.last_sequence_numbers.is_empty() {
            return records;
        }

        records
            .into_iter()
            .filter(|r| !self.last_sequence_numbers.contains(&r.sequence_number))
            .collect()
    }

    /// Re-reads the lease record and positions an iterator after its
    /// checkpoint. `None` when the shard is already completed.
    async fn start_shard_iterator(&mut self) -> Result<Option<String>> {
        let latest = self.checkpointer.fetch(&self.shard).await?;
        if latest.lease_owner != self.shard.lease_owner {
            return Err(KclError::lease_lost(&self.shard.shard_id));
        }
        self.shard = latest;

        let position = match self.shard.starting_position() {
            Some(position) => position,
            None => return Ok(None),
        };

        debug!(shard_id = %self.shard.shard_id, ?position, "getting shard iterator");

        self.stream_reader
            .get_shard_iterator(&self.shard.shard_id, &position)
            .await
            .map(Some)
    }

    /// Pulls a batch, recovering from expired iterators by re-leasing the
    /// shard and restarting from its checkpoint. Gives up once
    /// `expired_iterator_retries` recoveries have been spent.
    pub(crate) async fn safe_get_records(
        &mut self,
        shard_iterator: String,
    ) -> Result<GetRecordsOutput> {
        let mut shard_iterator = shard_iterator;
        let mut retries_left = self.config.expired_iterator_retries;

        loop {
            match self.stream_reader.get_records(&shard_iterator).await {
                Err(e) if e.is_expired_iterator() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        shard_id = %self.shard.shard_id,
                        error = %e,
                        retries_left,
                        "shard iterator expired, re-leasing shard"
                    );
                    shard_iterator = self.restart_from_checkpoint().await?;
                }
                result => return result,
            }
        }
    }

    async fn restart_from_checkpoint(&mut self) -> Result<String> {
        let owner = self.owner()?;

        let released = self.checkpointer.remove_lease_owner(&self.shard).await?;
        let latest = self.checkpointer.fetch(&released).await?;
        self.shard = self.checkpointer.lease(&latest, &owner).await?;
        self.last_renewed = Instant::now();

        self.start_shard_iterator()
            .await?
            .ok_or_else(|| KclError::InvalidCheckpoint {
                shard_id: self.shard.shard_id.clone(),
                reason: "shard was completed while its iterator was being refreshed".to_string(),
            })
    }

    async fn renew_lease_if_due(&mut self) -> Result<()> {
        let duration = match self.config.lease_duration() {
            Some(duration) => duration,
            None => return Ok(()),
        };
        if self.last_renewed.elapsed() < duration / 2 {
            return Ok(());
        }

        let owner = self.owner()?;
        let latest = self.checkpointer.fetch(&self.shard).await?;
        if latest.lease_owner != self.shard.lease_owner {
            return Err(KclError::lease_lost(&self.shard.shard_id));
        }

        self.shard = self.checkpointer.lease(&latest, &owner).await?;
        self.last_renewed = Instant::now();

        Ok(())
    }

    fn owner(&self) -> Result<String> {
        self.shard
            .lease_owner
            .clone()
            .ok_or_else(|| KclError::lease_lost(&self.shard.shard_id))
    }

    async fn shutdown_processor(&mut self, reason: ShutdownReason) -> Result<()> {
        let shard = self.shard.clone();
        let checkpointer = match reason {
            ShutdownReason::Requested => RecordCheckpointer::new(shard, self.checkpointer.clone()),
            ShutdownReason::Terminate => {
                RecordCheckpointer::for_shard_end(shard, self.checkpointer.clone())
            }
            ShutdownReason::Zombie => RecordCheckpointer::revoked(shard, self.checkpointer.clone()),
        };

        info!(shard_id = %self.shard.shard_id, %reason, "shutting down record processor");

        self.processor
            .shutdown(ShutdownInput {
                shard_id: self.shard.shard_id.clone(),
                shutdown_reason: reason,
                checkpointer: &checkpointer,
            })
            .await
            .map_err(|e| processor_error(&self.shard.shard_id, e))?;

        // A terminated shard is never read again, whatever the processor did.
        if reason == ShutdownReason::Terminate {
            self.shard = self.checkpointer.update_checkpoint(&self.shard, None).await?;
        }

        Ok(())
    }
}
