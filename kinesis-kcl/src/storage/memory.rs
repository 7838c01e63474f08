use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::LeaseStore;
use crate::consumer::lease::ShardInfo;
use crate::error::{KclError, Result};

/// Lease store living in process memory. Shares state across clones.
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<Mutex<BTreeMap<String, ShardInfo>>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
        operation: &'static str,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, ShardInfo>>> {
        self.leases
            .lock()
            .map_err(|_| KclError::store(operation, "lease table mutex poisoned"))
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get_lease(&self, shard_id: &str) -> Result<Option<ShardInfo>> {
        Ok(self.lock("get_lease")?.get(shard_id).cloned())
    }

    async fn create_lease_if_not_exists(&self, lease: &ShardInfo) -> Result<bool> {
        let map = &mut *self.lock("create_lease_if_not_exists")?;

        if map.contains_key(&lease.shard_id) {
            return Ok(false);
        }

        map.insert(lease.shard_id.clone(), lease.clone());
        Ok(true)
    }

    async fn update_lease(&self, lease: &ShardInfo, expected_counter: u64) -> Result<bool> {
        let map = &mut *self.lock("update_lease")?;

        match map.get_mut(&lease.shard_id) {
            Some(stored) if stored.lease_counter == expected_counter => {
                *stored = lease.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_leases(&self) -> Result<Vec<ShardInfo>> {
        Ok(self.lock("list_leases")?.values().cloned().collect())
    }
}
