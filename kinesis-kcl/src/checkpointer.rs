//! Lease and checkpoint mutations on top of a [`LeaseStore`].
//!
//! Every write is conditional on the `lease_counter` read just before it, so
//! two workers racing for the same shard cannot both win: the loser sees
//! [`KclError::LeaseLost`] and has to re-fetch before trying again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, ExtendedSequenceNumber};
use crate::config::Config;
use crate::consumer::lease::ShardInfo;
use crate::error::{KclError, Result};
use crate::storage::LeaseStore;

#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn LeaseStore>,
    lease_duration: Option<Duration>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn LeaseStore>, config: &Config) -> Self {
        Self {
            store,
            lease_duration: config.lease_duration(),
        }
    }

    /// Latest persisted state of `shard`, creating an unowned record with no
    /// checkpoint if the store has none yet.
    pub async fn fetch(&self, shard: &ShardInfo) -> Result<ShardInfo> {
        if let Some(lease) = self.store.get_lease(&shard.shard_id).await? {
            return Ok(lease);
        }

        let fresh = ShardInfo::new(shard.shard_id.clone(), shard.parent_shard_id.clone());
        if self.store.create_lease_if_not_exists(&fresh).await? {
            debug!(shard_id = %fresh.shard_id, "created lease record");
            return Ok(fresh);
        }

        // Lost the creation race; the other writer's record wins.
        self.store
            .get_lease(&shard.shard_id)
            .await?
            .ok_or_else(|| {
                KclError::store(
                    "fetch",
                    format!("lease record for {} disappeared", shard.shard_id),
                )
            })
    }

    /// Acquires or renews the lease on `shard` for `owner`.
    ///
    /// `shard` must be the caller's latest view: the write only lands if the
    /// stored counter still matches it.
    pub async fn lease(&self, shard: &ShardInfo, owner: &str) -> Result<ShardInfo> {
        let now = Utc::now().timestamp_millis();

        if !shard.is_leased_by(owner) && !shard.is_lease_expired(now) {
            debug!(
                shard_id = %shard.shard_id,
                owner = ?shard.lease_owner,
                "shard is leased by another worker"
            );
            return Err(KclError::lease_lost(&shard.shard_id));
        }

        let mut leased = shard.clone();
        leased.lease_owner = Some(owner.to_string());
        leased.lease_counter += 1;
        leased.lease_timeout = self
            .lease_duration
            .map(|duration| now + duration.as_millis() as i64);

        self.write(&leased, shard.lease_counter).await?;

        info!(
            shard_id = %leased.shard_id,
            owner,
            lease_counter = leased.lease_counter,
            "leased shard"
        );

        Ok(leased)
    }

    /// Clears the owner recorded in `shard` without touching the checkpoint.
    pub async fn remove_lease_owner(&self, shard: &ShardInfo) -> Result<ShardInfo> {
        let stored = self.fetch(shard).await?;

        if stored.lease_owner != shard.lease_owner {
            return Err(KclError::lease_lost(&shard.shard_id));
        }
        if stored.lease_owner.is_none() {
            return Ok(stored);
        }

        let mut released = stored.clone();
        released.lease_owner = None;
        released.lease_timeout = None;
        released.lease_counter += 1;

        self.write(&released, stored.lease_counter).await?;

        debug!(shard_id = %released.shard_id, "removed lease owner");

        Ok(released)
    }

    /// Persists `sequence_number` as the shard's checkpoint, or the shard end
    /// when `None`. The caller must still own the lease, and a checkpoint
    /// never moves backwards.
    pub async fn update_checkpoint(
        &self,
        shard: &ShardInfo,
        sequence_number: Option<&str>,
    ) -> Result<ShardInfo> {
        let checkpoint = match sequence_number {
            Some(sequence_number) => {
                if sequence_number.is_empty()
                    || !sequence_number.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err(KclError::InvalidCheckpoint {
                        shard_id: shard.shard_id.clone(),
                        reason: format!("{:?} is not a sequence number", sequence_number),
                    });
                }
                Checkpoint::SequenceNumber(sequence_number.to_string())
            }
            None => Checkpoint::ShardEnd,
        };

        let stored = self.fetch(shard).await?;

        if stored.lease_owner.is_none() || stored.lease_owner != shard.lease_owner {
            return Err(KclError::lease_lost(&shard.shard_id));
        }

        let next = ExtendedSequenceNumber::new(Some(checkpoint.clone()));
        let current = stored.extended_sequence_number();
        if next < current {
            return Err(KclError::InvalidCheckpoint {
                shard_id: shard.shard_id.clone(),
                reason: format!("{} is behind the stored checkpoint {}", next, current),
            });
        }

        let mut updated = stored.clone();
        updated.checkpoint = Some(checkpoint);
        updated.lease_counter += 1;

        self.write(&updated, stored.lease_counter).await?;

        debug!(shard_id = %updated.shard_id, checkpoint = %next, "updated checkpoint");

        Ok(updated)
    }

    async fn write(&self, lease: &ShardInfo, expected_counter: u64) -> Result<()> {
        if self.store.update_lease(lease, expected_counter).await? {
            Ok(())
        } else {
            Err(KclError::lease_lost(&lease.shard_id))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Records,
    ShardEnd,
    Revoked,
}

/// Checkpoint handle passed to a record processor for one shard.
pub struct RecordCheckpointer {
    shard: ShardInfo,
    checkpointer: Checkpointer,
    scope: Scope,
}

impl RecordCheckpointer {
    pub(crate) fn new(shard: ShardInfo, checkpointer: Checkpointer) -> Self {
        Self {
            shard,
            checkpointer,
            scope: Scope::Records,
        }
    }

    pub(crate) fn for_shard_end(shard: ShardInfo, checkpointer: Checkpointer) -> Self {
        Self {
            scope: Scope::ShardEnd,
            ..Self::new(shard, checkpointer)
        }
    }

    pub(crate) fn revoked(shard: ShardInfo, checkpointer: Checkpointer) -> Self {
        Self {
            scope: Scope::Revoked,
            ..Self::new(shard, checkpointer)
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard.shard_id
    }

    /// Records `sequence_number` as processed. `None` marks the shard end
    /// and is only accepted while shutting down a terminated shard.
    pub async fn update_checkpoint(&self, sequence_number: Option<&str>) -> Result<()> {
        let invalid = |reason: &str| KclError::InvalidCheckpoint {
            shard_id: self.shard.shard_id.clone(),
            reason: reason.to_string(),
        };

        match (self.scope, sequence_number) {
            (Scope::Revoked, _) => return Err(KclError::lease_lost(&self.shard.shard_id)),
            (Scope::Records, None) => {
                return Err(invalid("the shard end can only be checkpointed at termination"))
            }
            (Scope::ShardEnd, Some(_)) => {
                return Err(invalid("a terminated shard can only be checkpointed at its end"))
            }
            (Scope::Records, Some(_)) | (Scope::ShardEnd, None) => {}
        }

        self.checkpointer
            .update_checkpoint(&self.shard, sequence_number)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLeaseStore;

    const SHARD_ID: &str = "shardId-000000000000";

    fn checkpointer(config: &Config) -> (MemoryLeaseStore, Checkpointer) {
        let store = MemoryLeaseStore::new();
        let checkpointer = Checkpointer::new(Arc::new(store.clone()), config);
        (store, checkpointer)
    }

    async fn leased(checkpointer: &Checkpointer, owner: &str) -> ShardInfo {
        let shard = checkpointer
            .fetch(&ShardInfo::new(SHARD_ID, None))
            .await
            .unwrap();
        checkpointer.lease(&shard, owner).await.unwrap()
    }

    #[tokio::test]
    async fn test_fetch_creates_missing_record() {
        let (store, checkpointer) = checkpointer(&Config::default());

        let shard = checkpointer
            .fetch(&ShardInfo::new(SHARD_ID, Some("shardId-parent".into())))
            .await
            .unwrap();

        assert_eq!(shard.lease_counter, 0);
        assert_eq!(shard.lease_owner, None);
        assert_eq!(shard.checkpoint, None);
        assert_eq!(store.get_lease(SHARD_ID).await.unwrap(), Some(shard));
    }

    #[tokio::test]
    async fn test_lease_increments_counter() {
        let (_, checkpointer) = checkpointer(&Config::default());

        let shard = leased(&checkpointer, "worker-1").await;

        assert_eq!(shard.lease_counter, 1);
        assert!(shard.is_leased_by("worker-1"));
        assert_eq!(shard.lease_timeout, None);

        let renewed = checkpointer.lease(&shard, "worker-1").await.unwrap();
        assert_eq!(renewed.lease_counter, 2);
    }

    #[tokio::test]
    async fn test_only_one_concurrent_lease_wins() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let shard = checkpointer
            .fetch(&ShardInfo::new(SHARD_ID, None))
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            checkpointer.lease(&shard, "worker-1"),
            checkpointer.lease(&shard, "worker-2"),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(e) if e.is_lease_lost())));
    }

    #[tokio::test]
    async fn test_stale_view_loses_lease() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let stale = checkpointer
            .fetch(&ShardInfo::new(SHARD_ID, None))
            .await
            .unwrap();
        checkpointer.lease(&stale, "worker-1").await.unwrap();

        let err = checkpointer.lease(&stale, "worker-2").await.unwrap_err();

        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_live_lease_of_another_owner_is_refused() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let shard = leased(&checkpointer, "worker-1").await;

        let err = checkpointer.lease(&shard, "worker-2").await.unwrap_err();

        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let mut config = Config::default();
        config.lease_duration_ms = Some(10_000);
        let (store, checkpointer) = checkpointer(&config);
        let shard = leased(&checkpointer, "worker-1").await;
        assert!(shard.lease_timeout.is_some());

        let mut expired = shard.clone();
        expired.lease_timeout = Some(0);
        store.update_lease(&expired, shard.lease_counter).await.unwrap();

        let taken = checkpointer.lease(&expired, "worker-2").await.unwrap();
        assert!(taken.is_leased_by("worker-2"));
    }

    #[tokio::test]
    async fn test_remove_lease_owner_keeps_checkpoint() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let shard = leased(&checkpointer, "worker-1").await;
        checkpointer
            .update_checkpoint(&shard, Some("100"))
            .await
            .unwrap();

        let released = checkpointer.remove_lease_owner(&shard).await.unwrap();

        assert_eq!(released.lease_owner, None);
        assert_eq!(
            released.checkpoint,
            Some(Checkpoint::SequenceNumber("100".into()))
        );
        assert_eq!(released.lease_counter, 3);
    }

    #[tokio::test]
    async fn test_remove_lease_owner_never_clears_another_owner() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let shard = leased(&checkpointer, "worker-1").await;
        let released = checkpointer.remove_lease_owner(&shard).await.unwrap();
        checkpointer.lease(&released, "worker-2").await.unwrap();

        let err = checkpointer.remove_lease_owner(&shard).await.unwrap_err();

        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_checkpoints_are_monotonic() {
        let (store, checkpointer) = checkpointer(&Config::default());
        let shard = leased(&checkpointer, "worker-1").await;

        let attempts = ["10", "9", "10", "200", "199", "1000"];
        let mut accepted = Vec::new();
        for sequence_number in attempts {
            match checkpointer
                .update_checkpoint(&shard, Some(sequence_number))
                .await
            {
                Ok(_) => accepted.push(sequence_number),
                Err(KclError::InvalidCheckpoint { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(accepted, vec!["10", "10", "200", "1000"]);
        assert_eq!(
            store.get_lease(SHARD_ID).await.unwrap().unwrap().checkpoint,
            Some(Checkpoint::SequenceNumber("1000".into()))
        );
    }

    #[tokio::test]
    async fn test_checkpoint_requires_ownership() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let shard = leased(&checkpointer, "worker-1").await;
        let released = checkpointer.remove_lease_owner(&shard).await.unwrap();
        checkpointer.lease(&released, "worker-2").await.unwrap();

        let err = checkpointer
            .update_checkpoint(&shard, Some("5"))
            .await
            .unwrap_err();

        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_null_checkpoint_marks_shard_end() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let shard = leased(&checkpointer, "worker-1").await;
        checkpointer.update_checkpoint(&shard, Some("7")).await.unwrap();

        let ended = checkpointer.update_checkpoint(&shard, None).await.unwrap();

        assert!(ended.is_completed());
        assert!(matches!(
            checkpointer.update_checkpoint(&shard, Some("8")).await,
            Err(KclError::InvalidCheckpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_sentinel_strings_as_sequence_numbers() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let shard = leased(&checkpointer, "worker-1").await;

        for value in ["", "SHARD_END", "TRIM_HORIZON"] {
            assert!(matches!(
                checkpointer.update_checkpoint(&shard, Some(value)).await,
                Err(KclError::InvalidCheckpoint { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_record_checkpointer_scopes() {
        let (_, checkpointer) = checkpointer(&Config::default());
        let shard = leased(&checkpointer, "worker-1").await;

        let records = RecordCheckpointer::new(shard.clone(), checkpointer.clone());
        assert!(records.update_checkpoint(Some("3")).await.is_ok());
        assert!(records.update_checkpoint(None).await.is_err());

        let zombie = RecordCheckpointer::revoked(shard.clone(), checkpointer.clone());
        assert!(zombie.update_checkpoint(Some("4")).await.unwrap_err().is_lease_lost());

        let ending = RecordCheckpointer::for_shard_end(shard, checkpointer);
        assert!(ending.update_checkpoint(Some("4")).await.is_err());
        assert!(ending.update_checkpoint(None).await.is_ok());
    }
}
