use fleetsim_error::FSResult;
use fleetsim_models::{DeviceModel, Simulation, SimulationDeviceConfig, SimulationTarget};
use fleetsim_storage::Stores;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// Records loaded in bulk by `fleetsim import`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Catalog {
    pub targets: Vec<SimulationTarget>,
    pub models: Vec<DeviceModel>,
    pub simulations: Vec<Simulation>,
    pub device_configs: Vec<SimulationDeviceConfig>,
}

impl Catalog {
    pub async fn load(path: &Path) -> FSResult<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes every record; device models whose schema does not parse are
    /// stored anyway and reported.
    pub async fn import(&self, stores: &Stores) -> FSResult<()> {
        for target in &self.targets {
            stores.set_target(target).await?;
        }
        for model in &self.models {
            if let Err(e) = model.schema() {
                warn!(model_id = %model.id, error = %e, "Device model schema does not parse");
            }
            stores.set_device_model(model).await?;
        }
        for simulation in &self.simulations {
            stores.set_simulation(simulation).await?;
        }
        for config in &self.device_configs {
            stores.set_device_config(config).await?;
        }
        info!(
            targets = self.targets.len(),
            models = self.models.len(),
            simulations = self.simulations.len(),
            device_configs = self.device_configs.len(),
            "Catalog imported"
        );
        Ok(())
    }
}
