use crate::checkpoint::{Checkpoint, ExtendedSequenceNumber, StartingPosition};

/// Lease and checkpoint state for one shard, as last seen by this process.
///
/// The copy held by a consumer may be stale: the lease store is the only
/// authority, and `lease_counter` is the token every conditional write is
/// checked against.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ShardInfo {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub lease_owner: Option<String>,
    pub lease_counter: u64,
    /// Lease expiry in epoch milliseconds. Only set when leases expire.
    pub lease_timeout: Option<i64>,
}

impl ShardInfo {
    pub fn new(shard_id: impl Into<String>, parent_shard_id: Option<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id,
            checkpoint: None,
            lease_owner: None,
            lease_counter: 0,
            lease_timeout: None,
        }
    }

    /// All records of the shard were processed and it must not be read again.
    pub fn is_completed(&self) -> bool {
        self.checkpoint.as_ref().map_or(false, Checkpoint::is_shard_end)
    }

    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.lease_owner.as_deref() == Some(owner)
    }

    /// True when nobody holds the lease or the holder let it run out.
    pub fn is_lease_expired(&self, now_millis: i64) -> bool {
        match (&self.lease_owner, self.lease_timeout) {
            (None, _) => true,
            (Some(_), Some(timeout)) => timeout <= now_millis,
            (Some(_), None) => false,
        }
    }

    /// The shard still has records to consume and can be leased.
    pub fn is_available(&self, now_millis: i64) -> bool {
        !self.is_completed() && self.is_lease_expired(now_millis)
    }

    pub fn starting_position(&self) -> Option<StartingPosition> {
        StartingPosition::from_checkpoint(self.checkpoint.as_ref())
    }

    pub fn extended_sequence_number(&self) -> ExtendedSequenceNumber {
        ExtendedSequenceNumber::new(self.checkpoint.clone())
    }
}

impl std::fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(shard_id: {}, checkpoint: {}, lease_owner: {}, lease_counter: {})",
            &self.shard_id,
            self.extended_sequence_number(),
            self.lease_owner.as_deref().unwrap_or("<none>"),
            self.lease_counter
        )
    }
}
