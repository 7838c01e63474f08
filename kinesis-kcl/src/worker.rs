use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::futures_unordered::FuturesUnordered;
use futures::Future;
use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpointer::Checkpointer;
use crate::config::Config;
use crate::consumer::lease::ShardInfo;
use crate::consumer::Consumer;
use crate::error::{KclError, Result};
use crate::record_processor::RecordProcessorFactory;
use crate::storage::LeaseStore;
use crate::stream_reader::StreamReader;

/// Signals a running [`Worker`] and its consumers to stop.
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Logs when a consumer task goes away, including when it is aborted.
struct FinishedGuard {
    shard_id: String,
}

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        info!(shard_id = %self.shard_id, "finished consuming shard");
    }
}

/// Discovers the shards of a stream, leases the ones nobody else holds
/// and runs a [`Consumer`] task per leased shard.
pub struct Worker<R, F> {
    id: String,
    config: Arc<Config>,
    stream_reader: R,
    checkpointer: Checkpointer,
    processor_factory: Arc<F>,
    shards: BTreeMap<String, ShardInfo>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<R, F> Worker<R, F>
where
    R: StreamReader + Clone + 'static,
    F: RecordProcessorFactory + 'static,
{
    pub fn new(
        id: impl Into<String>,
        config: Config,
        stream_reader: R,
        lease_store: Arc<dyn LeaseStore>,
        processor_factory: F,
    ) -> Self {
        let checkpointer = Checkpointer::new(lease_store, &config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            id: id.into(),
            config: Arc::new(config),
            stream_reader,
            checkpointer,
            processor_factory: Arc::new(processor_factory),
            shards: BTreeMap::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Shard states as of the last sync or consumption round.
    pub fn shards(&self) -> &BTreeMap<String, ShardInfo> {
        &self.shards
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(self.shutdown_tx.clone())
    }

    /// Lists the stream's shards and loads (or creates) a lease record for
    /// each of them.
    pub async fn sync_shards(&mut self) -> Result<&BTreeMap<String, ShardInfo>> {
        let mut shards = BTreeMap::new();

        for shard in self.stream_reader.list_shards().await? {
            let info = self
                .checkpointer
                .fetch(&ShardInfo::new(shard.shard_id, shard.parent_shard_id))
                .await?;
            shards.insert(info.shard_id.clone(), info);
        }

        info!(
            stream_name = %self.config.stream_name,
            shards = shards.len(),
            "synced shards"
        );

        self.shards = shards;
        Ok(&self.shards)
    }

    /// Whether any known shard is unfinished and free to lease.
    pub fn available_lease_shard(&self) -> bool {
        let now = Utc::now().timestamp_millis();
        self.shards.values().any(|shard| self.is_leasable(shard, now))
    }

    /// Leases still held under this worker's id were left behind by an
    /// aborted round or an earlier process, and are taken back.
    fn is_leasable(&self, shard: &ShardInfo, now_millis: i64) -> bool {
        !shard.is_completed()
            && (shard.is_lease_expired(now_millis) || shard.is_leased_by(&self.id))
    }

    /// Child shards wait until the parent they were split or merged from is
    /// fully consumed.
    fn parent_completed(&self, shard: &ShardInfo) -> bool {
        match &shard.parent_shard_id {
            Some(parent_id) => self
                .shards
                .get(parent_id)
                .map_or(true, ShardInfo::is_completed),
            None => true,
        }
    }

    async fn lease_shards(&mut self) -> Result<Vec<ShardInfo>> {
        let now = Utc::now().timestamp_millis();
        let mut candidates: Vec<ShardInfo> = self
            .shards
            .values()
            .filter(|shard| {
                self.is_leasable(shard, now) && self.parent_completed(shard)
            })
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let limit = self.config.max_leases_per_worker.unwrap_or(usize::MAX);
        let mut leased = Vec::new();

        for candidate in candidates {
            if leased.len() >= limit {
                break;
            }

            let acquired = match self.checkpointer.fetch(&candidate).await {
                Ok(latest)
                    if self.is_leasable(&latest, Utc::now().timestamp_millis()) =>
                {
                    self.checkpointer.lease(&latest, &self.id).await
                }
                Ok(latest) => {
                    debug!(shard_id = %latest.shard_id, "shard is no longer available");
                    self.shards.insert(latest.shard_id.clone(), latest);
                    continue;
                }
                Err(e) => Err(e),
            };

            match acquired {
                Ok(shard) => {
                    self.shards.insert(shard.shard_id.clone(), shard.clone());
                    leased.push(shard);
                }
                Err(e) if e.is_lease_lost() => {
                    debug!(
                        shard_id = %candidate.shard_id,
                        "shard was leased by another worker"
                    );
                }
                Err(e) => {
                    self.release_all(&leased).await;
                    return Err(e);
                }
            }
        }

        Ok(leased)
    }

    async fn release_all(&self, leased: &[ShardInfo]) {
        for shard in leased {
            if let Err(e) = self.checkpointer.remove_lease_owner(shard).await {
                warn!(shard_id = %shard.shard_id, error = %e, "unable to release lease");
            }
        }
    }

    fn consume_shard(&self, shard: ShardInfo) -> impl Future<Output = Result<ShardInfo>> {
        let finished = FinishedGuard {
            shard_id: shard.shard_id.clone(),
        };
        let checkpointer = self.checkpointer.clone();
        let mut consumer = Consumer::new(
            shard,
            self.processor_factory.create_processor(),
            self.stream_reader.clone(),
            checkpointer.clone(),
            self.config.clone(),
            self.shutdown_rx.clone(),
        );

        async move {
            let _finished = finished;

            let reason = consumer.consume().await?;
            let released = checkpointer.remove_lease_owner(consumer.shard()).await?;

            debug!(shard_id = %released.shard_id, %reason, "released lease");

            Ok(released)
        }
    }

    /// Leases every available shard and consumes them concurrently until
    /// all consumers stop.
    ///
    /// The first consumer failure aborts its siblings and is returned once
    /// they have unwound. Leases held by aborted consumers are left in place.
    pub async fn consume_shards(&mut self) -> Result<()> {
        let leased = self.lease_shards().await?;
        if leased.is_empty() {
            return Ok(());
        }

        info!(worker_id = %self.id, shards = leased.len(), "consuming shards");

        let mut tasks: FuturesUnordered<_> = leased
            .into_iter()
            .map(|shard| tokio::spawn(self.consume_shard(shard)))
            .collect();

        while let Some(joined) = tasks.next().await {
            let outcome = joined
                .map_err(|e| KclError::TaskAborted {
                    message: e.to_string(),
                })
                .and_then(|result| result);

            match outcome {
                Ok(shard) => {
                    self.shards.insert(shard.shard_id.clone(), shard);
                }
                Err(e) => {
                    error!(error = %e, "consumer failed, aborting consumer tasks");
                    for task in tasks.iter() {
                        task.abort();
                    }
                    while tasks.next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Alternates shard syncs and consumption rounds until shut down.
    pub async fn run(&mut self) -> Result<()> {
        let mut shutdown = self.shutdown_rx.clone();

        info!(
            worker_id = %self.id,
            application_name = %self.config.application_name,
            stream_name = %self.config.stream_name,
            "starting worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.sync_shards().await?;
            if self.available_lease_shard() {
                self.consume_shards().await?;
            }

            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.shard_sync_interval()) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(worker_id = %self.id, "worker stopped");

        Ok(())
    }
}
