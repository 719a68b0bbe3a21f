//! Wave scheduler: owns the devices of one running simulation and pumps
//! work into the telemetry and reported property pools.

use crate::{
    context::{EngineContext, RunContext},
    device::{Device, SimulatedModel},
    pool::{WorkHandler, WorkerPool},
};
use async_trait::async_trait;
use fleetsim_error::{FSError, FSResult};
use fleetsim_models::{constants::device_id, Simulation, SimulationStatus};
use fleetsim_sdk::MetricLabels;
use fleetsim_storage::Stores;
use futures::{stream, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, instrument, warn};

/// Splits `items` into `group_count` consecutive groups of equal size; the
/// remainder goes to the last group. The count is clamped to `1..=items.len()`.
pub fn partition<T>(items: Vec<T>, group_count: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let groups = group_count.clamp(1, items.len());
    let size = items.len() / groups;
    let mut iter = items.into_iter();
    let mut out: Vec<Vec<T>> = (0..groups - 1)
        .map(|_| iter.by_ref().take(size).collect())
        .collect();
    out.push(iter.collect());
    out
}

type WaveGroups = Arc<Vec<Vec<Arc<Device>>>>;

struct TelemetryWork(Arc<RunContext>);

#[async_trait]
impl WorkHandler for TelemetryWork {
    type Item = Arc<Device>;

    async fn handle(&self, device: Arc<Device>) {
        device.send_telemetry(&self.0).await;
    }
}

struct ReportedPropertiesWork(Arc<RunContext>);

#[async_trait]
impl WorkHandler for ReportedPropertiesWork {
    type Item = Arc<Device>;

    async fn handle(&self, device: Arc<Device>) {
        device.send_reported_properties(&self.0).await;
    }
}

/// Cyclic dispatcher feeding one pool, group by group.
struct WavePump {
    pool: WorkerPool<Arc<Device>>,
    groups: WaveGroups,
    warmup: Duration,
    group_interval: Duration,
    cycle_interval: Duration,
}

impl WavePump {
    async fn run(self, cancel: CancellationToken) {
        if !self.warmup.is_zero() && !sleep_or_cancel(self.warmup, &cancel).await {
            return;
        }
        let last = self.groups.len().saturating_sub(1);
        let mut cycle = 0u64;
        loop {
            for (ordinal, group) in self.groups.iter().enumerate() {
                for device in group {
                    if !self.pool.submit(Arc::clone(device), &cancel).await {
                        return;
                    }
                }
                if ordinal < last && !sleep_or_cancel(self.group_interval, &cancel).await {
                    return;
                }
            }
            cycle += 1;
            debug!(pool = self.pool.name(), cycle, "Wave cycle dispatched");
            if !sleep_or_cancel(self.cycle_interval, &cancel).await {
                return;
            }
        }
    }
}

/// Returns `false` when cancelled before `delay` elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// A running simulation.
pub struct Simulator {
    ctx: Arc<RunContext>,
    groups: WaveGroups,
    devices: Vec<Arc<Device>>,
    models: Vec<Arc<SimulatedModel>>,
    stopped: AtomicBool,
}

impl Simulator {
    /// Validates the simulation, builds its devices and starts the pumps.
    ///
    /// Validation failures return before any status is written.
    #[instrument(name = "simulation-start", skip_all, fields(sim_id = %simulation_id))]
    pub async fn start(
        engine: EngineContext,
        simulation_id: &str,
        parent: &CancellationToken,
    ) -> FSResult<Self> {
        let stores = engine.stores.clone();
        let simulation = stores
            .get_simulation(simulation_id)
            .await?
            .ok_or_else(|| FSError::NotFound(format!("simulation {simulation_id}")))?;
        if !simulation.status.can_start() {
            return Err(FSError::InvalidStateError(format!(
                "simulation {simulation_id} is {}",
                simulation.status
            )));
        }
        let target = stores
            .get_target(&simulation.target_id)
            .await?
            .ok_or_else(|| FSError::NotFound(format!("target {}", simulation.target_id)))?;
        let configs = stores.list_device_configs(simulation_id).await?;
        if configs.is_empty() {
            return Err(FSError::InvalidStateError(format!(
                "simulation {simulation_id} has no device configurations"
            )));
        }

        let mut models: HashMap<String, Arc<SimulatedModel>> = HashMap::new();
        let mut devices = Vec::new();
        for config in &configs {
            let model = match models.get(&config.model_id) {
                Some(model) => Arc::clone(model),
                None => {
                    let stored = stores
                        .get_device_model(&config.model_id)
                        .await?
                        .ok_or_else(|| FSError::NotFound(format!("device model {}", config.model_id)))?;
                    let model = Arc::new(SimulatedModel {
                        schema: stored.schema()?,
                        model_id: stored.model_id(),
                        labels: MetricLabels::new(&simulation.id, &target.id, &stored.id),
                        id: stored.id,
                    });
                    models.insert(config.model_id.clone(), Arc::clone(&model));
                    model
                }
            };
            devices.extend((1..=config.device_count).map(|ordinal| {
                Arc::new(Device::new(
                    device_id(&simulation.id, &target.id, &config.id, ordinal),
                    Arc::clone(&model),
                ))
            }));
        }
        let groups: WaveGroups = Arc::new(partition(devices.clone(), simulation.wave_group_count));

        write_status(&stores, &simulation, SimulationStatus::Starting).await?;

        let ctx = Arc::new(RunContext {
            engine,
            simulation: simulation.with_status(SimulationStatus::Starting),
            target,
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
        });
        let models: Vec<Arc<SimulatedModel>> = models.into_values().collect();
        for model in &models {
            let count = devices.iter().filter(|d| Arc::ptr_eq(d.model(), model)).count();
            ctx.metrics().simulated_devices(&model.labels, count as u64);
        }

        let simulator = Self {
            ctx,
            groups,
            devices,
            models,
            stopped: AtomicBool::new(false),
        };
        simulator.start_pumps();

        write_status(&stores, &simulator.ctx.simulation, SimulationStatus::Running).await?;
        info!(
            devices = simulator.devices.len(),
            groups = simulator.groups.len(),
            "🚀 Simulation running"
        );
        Ok(simulator)
    }

    fn start_pumps(&self) {
        let ctx = &self.ctx;
        let config = ctx.config();
        let total = self.devices.len();
        if total == 0 {
            warn!("Simulation has no devices, nothing to pump");
            return;
        }

        if config.enable_telemetry {
            let workers = config.max_concurrent_connections.clamp(1, total);
            let pool = WorkerPool::start(
                "telemetry",
                workers,
                workers * config.queue_capacity_factor,
                Arc::new(TelemetryWork(Arc::clone(ctx))),
                ctx.cancel.clone(),
                &ctx.tracker,
            );
            let pump = WavePump {
                pool,
                groups: Arc::clone(&self.groups),
                warmup: Duration::ZERO,
                group_interval: ctx.simulation.wave_group_interval(),
                cycle_interval: ctx.simulation.telemetry_interval(),
            };
            ctx.tracker.spawn(pump.run(ctx.cancel.clone()));
        }

        if config.enable_reported_props {
            let workers = config.max_concurrent_twin_updates.clamp(1, total);
            let pool = WorkerPool::start(
                "reported-properties",
                workers,
                workers * config.queue_capacity_factor,
                Arc::new(ReportedPropertiesWork(Arc::clone(ctx))),
                ctx.cancel.clone(),
                &ctx.tracker,
            );
            let pump = WavePump {
                pool,
                groups: Arc::clone(&self.groups),
                warmup: config.reported_props_warmup(),
                group_interval: ctx.simulation.wave_group_interval(),
                cycle_interval: ctx.simulation.reported_property_interval(),
            };
            ctx.tracker.spawn(pump.run(ctx.cancel.clone()));
        }
    }

    /// Writes `Stopping`, cancels every pump and worker, disconnects all
    /// devices and writes `Stopped`. Later calls are no-ops once a stop has
    /// succeeded; a stop that failed to write a status can be called again.
    #[instrument(name = "simulation-stop", skip_all, fields(sim_id = %self.ctx.simulation.id))]
    pub async fn stop(&self) -> FSResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Simulation already stopped");
            return Ok(());
        }
        let stores = &self.ctx.engine.stores;
        if let Err(e) = write_status(stores, &self.ctx.simulation, SimulationStatus::Stopping).await {
            self.stopped.store(false, Ordering::Release);
            return Err(e);
        }

        self.ctx.cancel.cancel();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;

        let ctx = &self.ctx;
        let limit = ctx.config().max_concurrent_connections.max(1);
        stream::iter(self.devices.iter())
            .for_each_concurrent(limit, |device| async move {
                device.disconnect(ctx).await;
            })
            .await;
        for model in &self.models {
            ctx.metrics().simulated_devices(&model.labels, 0);
        }

        if let Err(e) = write_status(stores, &self.ctx.simulation, SimulationStatus::Stopped).await {
            self.stopped.store(false, Ordering::Release);
            return Err(e);
        }
        info!("🛑 Simulation stopped");
        Ok(())
    }

    #[inline]
    pub fn simulation(&self) -> &Simulation {
        &self.ctx.simulation
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn wave_groups(&self) -> &[Vec<Arc<Device>>] {
        &self.groups
    }

    pub fn connected_device_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_connected()).count()
    }

    /// Connected devices per device model id.
    pub fn connected_device_counts(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = self
            .models
            .iter()
            .map(|model| (model.id.clone(), 0))
            .collect();
        for device in self.devices.iter().filter(|d| d.is_connected()) {
            *counts.entry(device.model().id.clone()).or_default() += 1;
        }
        counts
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}

/// Persists `status` on the stored record, keeping fields edited meanwhile.
async fn write_status(stores: &Stores, fallback: &Simulation, status: SimulationStatus) -> FSResult<()> {
    let current = stores
        .get_simulation(&fallback.id)
        .await?
        .unwrap_or_else(|| fallback.clone());
    stores.set_simulation(&current.with_status(status)).await?;
    debug!(sim_id = %fallback.id, %status, "Simulation status written");
    Ok(())
}
