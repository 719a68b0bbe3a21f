use fleetsim_error::{storage::StorageError, StorageResult};
use fleetsim_models::{
    constants::{
        device_config_key, device_configs_prefix, device_model_key, simulation_key, target_key,
        target_device_key, target_devices_prefix, DEVICE_MODEL_PREFIX, SIMULATION_PREFIX,
        TARGET_PREFIX,
    },
    DeviceModel, ObjectStore, Simulation, SimulationDeviceConfig, SimulationTarget,
    SimulationTargetDevice,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Typed access to the records kept in an [`ObjectStore`].
#[derive(Clone)]
pub struct Stores {
    store: Arc<dyn ObjectStore>,
}

impl Stores {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    #[inline]
    pub fn raw(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> StorageResult<Vec<T>> {
        self.store
            .list(prefix)
            .await?
            .into_iter()
            .map(|(key, raw)| decode(&key, &raw))
            .collect()
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let raw = serde_json::to_vec(value).map_err(|e| StorageError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.store.set(key, raw).await
    }

    // ----- simulations -----

    pub async fn get_simulation(&self, id: &str) -> StorageResult<Option<Simulation>> {
        self.get_json(&simulation_key(id)).await
    }

    /// Like [`Stores::get_simulation`] but a missing record is an error.
    pub async fn require_simulation(&self, id: &str) -> StorageResult<Simulation> {
        self.get_simulation(id)
            .await?
            .ok_or_else(|| StorageError::EntityNotFound(simulation_key(id)))
    }

    pub async fn list_simulations(&self) -> StorageResult<Vec<Simulation>> {
        self.list_json(SIMULATION_PREFIX).await
    }

    pub async fn set_simulation(&self, simulation: &Simulation) -> StorageResult<()> {
        self.set_json(&simulation_key(&simulation.id), simulation).await
    }

    pub async fn delete_simulation(&self, id: &str) -> StorageResult<()> {
        self.store.delete(&simulation_key(id)).await
    }

    // ----- targets -----

    pub async fn get_target(&self, id: &str) -> StorageResult<Option<SimulationTarget>> {
        self.get_json(&target_key(id)).await
    }

    pub async fn require_target(&self, id: &str) -> StorageResult<SimulationTarget> {
        self.get_target(id)
            .await?
            .ok_or_else(|| StorageError::EntityNotFound(target_key(id)))
    }

    pub async fn list_targets(&self) -> StorageResult<Vec<SimulationTarget>> {
        self.list_json(TARGET_PREFIX).await
    }

    pub async fn set_target(&self, target: &SimulationTarget) -> StorageResult<()> {
        self.set_json(&target_key(&target.id), target).await
    }

    // ----- device models -----

    pub async fn get_device_model(&self, id: &str) -> StorageResult<Option<DeviceModel>> {
        self.get_json(&device_model_key(id)).await
    }

    pub async fn require_device_model(&self, id: &str) -> StorageResult<DeviceModel> {
        self.get_device_model(id)
            .await?
            .ok_or_else(|| StorageError::EntityNotFound(device_model_key(id)))
    }

    pub async fn list_device_models(&self) -> StorageResult<Vec<DeviceModel>> {
        self.list_json(DEVICE_MODEL_PREFIX).await
    }

    pub async fn set_device_model(&self, model: &DeviceModel) -> StorageResult<()> {
        self.set_json(&device_model_key(&model.id), model).await
    }

    // ----- device configs -----

    pub async fn list_device_configs(
        &self,
        sim_id: &str,
    ) -> StorageResult<Vec<SimulationDeviceConfig>> {
        self.list_json(&device_configs_prefix(sim_id)).await
    }

    pub async fn set_device_config(&self, config: &SimulationDeviceConfig) -> StorageResult<()> {
        self.set_json(&device_config_key(&config.simulation_id, &config.id), config)
            .await
    }

    pub async fn delete_device_config(&self, sim_id: &str, config_id: &str) -> StorageResult<()> {
        self.store.delete(&device_config_key(sim_id, config_id)).await
    }

    // ----- cached device connections -----

    pub async fn get_target_device(
        &self,
        target_id: &str,
        device_id: &str,
    ) -> StorageResult<Option<SimulationTargetDevice>> {
        self.get_json(&target_device_key(target_id, device_id)).await
    }

    pub async fn list_target_devices(
        &self,
        target_id: &str,
    ) -> StorageResult<Vec<SimulationTargetDevice>> {
        self.list_json(&target_devices_prefix(target_id)).await
    }

    pub async fn set_target_device(&self, device: &SimulationTargetDevice) -> StorageResult<()> {
        self.set_json(&target_device_key(&device.target_id, &device.device_id), device)
            .await
    }

    pub async fn delete_target_device(&self, target_id: &str, device_id: &str) -> StorageResult<()> {
        self.store
            .delete(&target_device_key(target_id, device_id))
            .await
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(raw).map_err(|e| StorageError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
