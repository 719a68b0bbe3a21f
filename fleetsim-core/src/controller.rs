use crate::{context::EngineContext, provisioner::Registration, simulator::Simulator};
use fleetsim_error::{FSError, FSResult};
use fleetsim_models::{
    constants::device_id, Simulation, SimulationDeviceConfig, SimulationStatus, SimulationTarget,
};
use fleetsim_sdk::MetricLabels;
use futures::{stream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outcome of a bulk provision or delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Process-wide entry point: runs simulators and resizes device fleets.
pub struct SimulationController {
    engine: EngineContext,
    running: Mutex<HashMap<String, Arc<Simulator>>>,
    cancel: CancellationToken,
}

impl SimulationController {
    pub fn new(engine: EngineContext, cancel: CancellationToken) -> Self {
        Self {
            engine,
            running: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    #[inline]
    pub fn engine(&self) -> &EngineContext {
        &self.engine
    }

    pub async fn start_simulation(&self, simulation_id: &str) -> FSResult<Arc<Simulator>> {
        let mut running = self.running.lock().await;
        if running.contains_key(simulation_id) {
            return Err(FSError::InvalidStateError(format!(
                "simulation {simulation_id} is already running"
            )));
        }
        let simulator = Arc::new(Simulator::start(self.engine.clone(), simulation_id, &self.cancel).await?);
        running.insert(simulation_id.to_string(), Arc::clone(&simulator));
        Ok(simulator)
    }

    /// Stops a running simulation. It stays registered until the stop succeeds,
    /// so a failed stop can be retried.
    pub async fn stop_simulation(&self, simulation_id: &str) -> FSResult<()> {
        let simulator = self
            .running
            .lock()
            .await
            .get(simulation_id)
            .cloned()
            .ok_or_else(|| {
                FSError::InvalidStateError(format!("simulation {simulation_id} is not running"))
            })?;
        simulator.stop().await?;
        self.forget(simulation_id, &simulator).await;
        Ok(())
    }

    /// Stops every running simulation; failures are logged and the rest still stop.
    pub async fn stop_all(&self) {
        let simulators: Vec<_> = self
            .running
            .lock()
            .await
            .iter()
            .map(|(id, simulator)| (id.clone(), Arc::clone(simulator)))
            .collect();
        for (id, simulator) in simulators {
            match simulator.stop().await {
                Ok(()) => self.forget(&id, &simulator).await,
                Err(e) => warn!(sim_id = %id, error = %e, "Failed to stop simulation"),
            }
        }
    }

    async fn forget(&self, simulation_id: &str, simulator: &Arc<Simulator>) {
        let mut running = self.running.lock().await;
        if running
            .get(simulation_id)
            .is_some_and(|current| Arc::ptr_eq(current, simulator))
        {
            running.remove(simulation_id);
        }
    }

    pub async fn is_running(&self, simulation_id: &str) -> bool {
        self.running.lock().await.contains_key(simulation_id)
    }

    /// Live connected devices of a model, 0 when the simulation is not running.
    pub async fn connected_device_count(&self, simulation_id: &str, model_id: &str) -> usize {
        match self.running.lock().await.get(simulation_id) {
            Some(simulator) => simulator
                .connected_device_counts()
                .get(model_id)
                .copied()
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Returns every stored simulation to `Ready`; nothing survives a restart.
    pub async fn reset_simulation_status(&self) -> FSResult<()> {
        for simulation in self.engine.stores.list_simulations().await? {
            if simulation.status != SimulationStatus::Ready {
                debug!(sim_id = %simulation.id, status = %simulation.status, "Resetting simulation status");
            }
            self.engine
                .stores
                .set_simulation(&simulation.with_status(SimulationStatus::Ready))
                .await?;
        }
        Ok(())
    }

    async fn load(&self, simulation_id: &str) -> FSResult<(Simulation, SimulationTarget)> {
        let stores = &self.engine.stores;
        let simulation = stores
            .get_simulation(simulation_id)
            .await?
            .ok_or_else(|| FSError::NotFound(format!("simulation {simulation_id}")))?;
        let target = stores
            .get_target(&simulation.target_id)
            .await?
            .ok_or_else(|| FSError::NotFound(format!("target {}", simulation.target_id)))?;
        Ok((simulation, target))
    }

    /// Registers ordinals `start_ordinal + 1 ..= start_ordinal + count` of a model.
    #[instrument(skip_all, fields(sim_id = %simulation.id, model_id = %model_id))]
    pub async fn provision_devices(
        &self,
        simulation: &Simulation,
        target: &SimulationTarget,
        model_id: &str,
        start_ordinal: usize,
        count: usize,
    ) -> FSResult<FleetOutcome> {
        let model = self
            .engine
            .stores
            .get_device_model(model_id)
            .await?
            .ok_or_else(|| FSError::NotFound(format!("device model {model_id}")))?;
        let announced = model.model_id();
        let labels = MetricLabels::new(&simulation.id, &target.id, model_id);
        let provisioner = &self.engine.provisioner;
        let cancel = &self.cancel;

        let results: Vec<bool> = stream::iter(start_ordinal + 1..=start_ordinal + count)
            .map(|ordinal| {
                let device_id = device_id(&simulation.id, &target.id, model_id, ordinal);
                let announced = announced.as_str();
                let labels = &labels;
                async move {
                    let registration = Registration {
                        target,
                        device_id: &device_id,
                        model_id: announced,
                        labels,
                    };
                    provisioner.provision_cached(registration, cancel).await.is_ok()
                }
            })
            .buffer_unordered(self.engine.config.max_concurrent_registrations.max(1))
            .collect()
            .await;

        let outcome = tally(&results);
        info!(succeeded = outcome.succeeded, failed = outcome.failed, "Devices provisioned");
        Ok(outcome)
    }

    /// Deletes ordinals `max_ordinal - count + 1 ..= max_ordinal` of a model.
    pub async fn delete_devices(
        &self,
        simulation: &Simulation,
        target: &SimulationTarget,
        model_id: &str,
        max_ordinal: usize,
        count: usize,
    ) -> FleetOutcome {
        let ids: Vec<String> = (0..count.min(max_ordinal))
            .map(|i| device_id(&simulation.id, &target.id, model_id, max_ordinal - i))
            .collect();
        self.delete_many(target, ids).await
    }

    /// Deletes every cached device of the simulation on its target.
    pub async fn delete_all_devices(&self, simulation_id: &str) -> FSResult<FleetOutcome> {
        let (simulation, target) = self.load(simulation_id).await?;
        let prefix = format!("{}-{}-", simulation.id, target.id);
        let ids: Vec<String> = self
            .engine
            .stores
            .list_target_devices(&target.id)
            .await?
            .into_iter()
            .filter(|d| d.device_id.starts_with(&prefix))
            .map(|d| d.device_id)
            .collect();
        let outcome = self.delete_many(&target, ids).await;
        info!(sim_id = %simulation.id, deleted = outcome.succeeded, "All simulation devices deleted");
        Ok(outcome)
    }

    async fn delete_many(&self, target: &SimulationTarget, ids: Vec<String>) -> FleetOutcome {
        let results: Vec<bool> = stream::iter(ids)
            .map(|id| async move { self.delete_device(target, &id).await })
            .buffer_unordered(self.engine.config.max_concurrent_deletes.max(1))
            .collect()
            .await;
        tally(&results)
    }

    /// Removes the device from the application and the cache. Remote errors are ignored.
    async fn delete_device(&self, target: &SimulationTarget, device_id: &str) -> bool {
        if let Err(e) = self
            .engine
            .management
            .delete_device(&target.app_url, &target.app_token, device_id)
            .await
        {
            debug!(device_id, error = %e, "Remote device delete failed, ignored");
        }
        match self.engine.cache().invalidate(&target.id, device_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device_id, error = %e, "Failed to remove cached device");
                false
            }
        }
    }

    /// Brings the cached population of a model to `device_count` and records it
    /// as the simulation's device configuration for that model.
    ///
    /// The simulation reads `Provisioning` or `Deleting` while the work runs and
    /// `Ready` afterwards, even when the work failed.
    #[instrument(skip_all, fields(sim_id = %simulation_id, model_id = %model_id, device_count = device_count))]
    pub async fn resize(
        &self,
        simulation_id: &str,
        model_id: &str,
        device_count: usize,
    ) -> FSResult<FleetOutcome> {
        if self.is_running(simulation_id).await {
            return Err(FSError::InvalidStateError(format!(
                "simulation {simulation_id} is running"
            )));
        }
        let (simulation, target) = self.load(simulation_id).await?;
        let stores = &self.engine.stores;

        let prefix = format!("{}-{}-{}-", simulation.id, target.id, model_id);
        let ordinals: Vec<usize> = stores
            .list_target_devices(&target.id)
            .await?
            .iter()
            .filter_map(|d| d.device_id.strip_prefix(&prefix)?.parse().ok())
            .collect();
        let existing = ordinals.len();
        let max_ordinal = ordinals.iter().copied().max().unwrap_or(0);

        let status = if device_count >= existing {
            SimulationStatus::Provisioning
        } else {
            SimulationStatus::Deleting
        };
        stores.set_simulation(&simulation.with_status(status)).await?;

        let result = if device_count > existing {
            self.provision_devices(&simulation, &target, model_id, max_ordinal, device_count - existing)
                .await
        } else {
            Ok(self
                .delete_devices(&simulation, &target, model_id, max_ordinal, existing - device_count)
                .await)
        };
        let result = match result {
            Ok(outcome) => stores
                .set_device_config(&SimulationDeviceConfig {
                    id: model_id.to_string(),
                    simulation_id: simulation.id.clone(),
                    model_id: model_id.to_string(),
                    device_count,
                })
                .await
                .map(|_| outcome)
                .map_err(FSError::from),
            Err(e) => Err(e),
        };

        stores
            .set_simulation(&simulation.with_status(SimulationStatus::Ready))
            .await?;
        result
    }
}

fn tally(results: &[bool]) -> FleetOutcome {
    let succeeded = results.iter().filter(|ok| **ok).count();
    FleetOutcome {
        succeeded,
        failed: results.len() - succeeded,
    }
}
