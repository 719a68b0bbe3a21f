use crate::Stores;
use fleetsim_error::StorageResult;
use fleetsim_models::SimulationTargetDevice;
use moka::future::{Cache, CacheBuilder};
use std::time::Duration;
use tracing::trace;

/// Read-through cache of device connection strings.
///
/// The store stays the source of truth; moka only saves store round trips for
/// devices that reconnect often. Invalidation clears both layers.
#[derive(Clone)]
pub struct ConnectionCache {
    stores: Stores,
    inner: Cache<String, String>,
}

impl ConnectionCache {
    pub fn new(stores: Stores, max_capacity: u64, time_to_idle: Duration) -> Self {
        let inner = CacheBuilder::new(max_capacity.max(1))
            .name("device-connections")
            .time_to_idle(time_to_idle)
            .build();
        Self { stores, inner }
    }

    #[inline]
    fn cache_key(target_id: &str, device_id: &str) -> String {
        format!("{target_id}/{device_id}")
    }

    pub async fn get(&self, target_id: &str, device_id: &str) -> StorageResult<Option<String>> {
        let key = Self::cache_key(target_id, device_id);
        if let Some(hit) = self.inner.get(&key).await {
            trace!(device_id, "Connection cache hit");
            return Ok(Some(hit));
        }
        let Some(record) = self.stores.get_target_device(target_id, device_id).await? else {
            return Ok(None);
        };
        self.inner
            .insert(key, record.connection_string.clone())
            .await;
        Ok(Some(record.connection_string))
    }

    /// Persists the connection string; last writer wins.
    pub async fn set(
        &self,
        target_id: &str,
        device_id: &str,
        connection_string: &str,
    ) -> StorageResult<()> {
        let record = SimulationTargetDevice {
            target_id: target_id.to_string(),
            device_id: device_id.to_string(),
            connection_string: connection_string.to_string(),
        };
        let key = Self::cache_key(target_id, device_id);
        // the memory layer never holds a value the store rejected
        self.inner.invalidate(&key).await;
        self.stores.set_target_device(&record).await?;
        self.inner.insert(key, record.connection_string).await;
        Ok(())
    }

    pub async fn invalidate(&self, target_id: &str, device_id: &str) -> StorageResult<()> {
        self.inner
            .invalidate(&Self::cache_key(target_id, device_id))
            .await;
        self.stores.delete_target_device(target_id, device_id).await
    }

    #[inline]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }
}
