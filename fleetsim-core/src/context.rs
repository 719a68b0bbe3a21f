use crate::provisioner::Provisioner;
use fleetsim_error::{transport::TransportError, TransportResult};
use fleetsim_models::{settings::SimulationConfig, Simulation, SimulationTarget};
use fleetsim_sdk::{DeviceTransport, ManagementApi, RegistrationApi, SimulationMetrics};
use fleetsim_storage::{ConnectionCache, Stores};
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Collaborators shared by every simulation of the process.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<SimulationConfig>,
    pub stores: Stores,
    pub transport: Arc<dyn DeviceTransport>,
    pub provisioner: Arc<Provisioner>,
    pub management: Arc<dyn ManagementApi>,
    pub metrics: Arc<dyn SimulationMetrics>,
}

impl EngineContext {
    pub fn new(
        config: SimulationConfig,
        cache: ConnectionCache,
        transport: Arc<dyn DeviceTransport>,
        registration: Arc<dyn RegistrationApi>,
        management: Arc<dyn ManagementApi>,
        metrics: Arc<dyn SimulationMetrics>,
    ) -> Self {
        let provisioner = Arc::new(Provisioner::new(
            registration,
            cache.clone(),
            Arc::clone(&metrics),
            &config,
        ));
        Self {
            config: Arc::new(config),
            stores: cache.stores().clone(),
            transport,
            provisioner,
            management,
            metrics,
        }
    }

    #[inline]
    pub fn cache(&self) -> &ConnectionCache {
        self.provisioner.cache()
    }
}

/// Scope of one simulation run: its records, its cancellation and its tasks.
pub struct RunContext {
    pub engine: EngineContext,
    pub simulation: Simulation,
    pub target: SimulationTarget,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

impl RunContext {
    #[inline]
    pub fn config(&self) -> &SimulationConfig {
        &self.engine.config
    }

    #[inline]
    pub fn metrics(&self) -> &dyn SimulationMetrics {
        self.engine.metrics.as_ref()
    }
}

/// Bounds a transport call, turning an elapsed deadline into `TransportError::Timeout`.
pub async fn bounded<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = TransportResult<T>>,
) -> TransportResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            timeout_ms: limit.as_millis() as u64,
            operation: operation.to_string(),
        }),
    }
}
