use backoff::backoff::Backoff;
use fleetsim_error::{provision::ProvisionError, FSResult, ProvisionResult};
use fleetsim_models::{settings::SimulationConfig, SimulationTarget};
use fleetsim_sdk::{
    build_exponential_backoff, ConnectionString, ErrorKind, MetricLabels, OperationStatus,
    RegistrationApi, RegistrationRequest, RetryPolicy, SimulationMetrics,
};
use fleetsim_storage::ConnectionCache;
use fleetsim_utils::sas::{create_sas_token, derive_device_key, expiry_after, REGISTRATION_KEY_NAME};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Used when an in-progress poll answer does not suggest a delay
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const REGISTRATION_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Device identity a registration is performed for.
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    pub target: &'a SimulationTarget,
    pub device_id: &'a str,
    /// Model id sent as registration metadata
    pub model_id: &'a str,
    pub labels: &'a MetricLabels,
}

/// Register-then-poll provisioning driver.
///
/// Holds no per-device state; concurrent registrations are capped by a
/// semaphore shared by every caller.
pub struct Provisioner {
    api: Arc<dyn RegistrationApi>,
    cache: ConnectionCache,
    metrics: Arc<dyn SimulationMetrics>,
    permits: Arc<Semaphore>,
    max_attempts: u32,
    register_retry: RetryPolicy,
}

impl Provisioner {
    pub fn new(
        api: Arc<dyn RegistrationApi>,
        cache: ConnectionCache,
        metrics: Arc<dyn SimulationMetrics>,
        config: &SimulationConfig,
    ) -> Self {
        Self {
            api,
            cache,
            metrics,
            permits: Arc::new(Semaphore::new(config.max_concurrent_registrations.max(1))),
            max_attempts: config.max_registration_attempts.max(1),
            register_retry: config.register_retry,
        }
    }

    #[inline]
    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    /// Returns the cached connection string, registering the device on a miss.
    ///
    /// Cache read and write failures are logged and otherwise ignored.
    pub async fn provision_cached(
        &self,
        registration: Registration<'_>,
        cancel: &CancellationToken,
    ) -> FSResult<String> {
        let target_id = registration.target.id.as_str();
        match self.cache.get(target_id, registration.device_id).await {
            Ok(Some(connection)) => return Ok(connection),
            Ok(None) => {}
            Err(e) => warn!(device_id = registration.device_id, error = %e, "Connection cache read failed"),
        }

        let connection = self.provision(registration, cancel).await?;
        if let Err(e) = self
            .cache
            .set(target_id, registration.device_id, &connection)
            .await
        {
            warn!(device_id = registration.device_id, error = %e, "Connection cache write failed");
        }
        Ok(connection)
    }

    /// Registers the device and returns its connection string, recording the outcome.
    #[instrument(skip_all, fields(device_id = registration.device_id))]
    pub async fn provision(
        &self,
        registration: Registration<'_>,
        cancel: &CancellationToken,
    ) -> ProvisionResult<String> {
        let started = Instant::now();
        let result = self.register(registration, cancel).await;
        match &result {
            Ok(_) => {
                self.metrics
                    .provision_success(registration.labels, started.elapsed());
                debug!(elapsed = ?started.elapsed(), "Device provisioned");
            }
            Err(ProvisionError::Cancelled) => {}
            Err(e) => {
                self.metrics
                    .provision_failure(registration.labels, ErrorKind::from_provision(e));
                warn!(error = %e, "Device provisioning failed");
            }
        }
        result
    }

    async fn register(
        &self,
        registration: Registration<'_>,
        cancel: &CancellationToken,
    ) -> ProvisionResult<String> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| ProvisionError::Cancelled)?,
        };

        let target = registration.target;
        let device_key = derive_device_key(&target.master_key, registration.device_id)?;
        let sas_token = create_sas_token(
            &device_key,
            &format!("{}/registrations/{}", target.id_scope, registration.device_id),
            Some(REGISTRATION_KEY_NAME),
            expiry_after(REGISTRATION_TOKEN_TTL),
        )?;
        let request = RegistrationRequest {
            endpoint: target.provisioning_url.clone(),
            id_scope: target.id_scope.clone(),
            registration_id: registration.device_id.to_string(),
            model_id: registration.model_id.to_string(),
            sas_token,
        };

        let operation_id = self.submit(&request, cancel).await?;

        for attempt in 1..=self.max_attempts {
            let status = tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                status = self.api.operation_status(&request, &operation_id) => status?,
            };
            match status {
                OperationStatus::Assigned(state) => {
                    let device_id = if state.device_id.is_empty() {
                        registration.device_id.to_string()
                    } else {
                        state.device_id
                    };
                    return Ok(ConnectionString::new(state.assigned_hub, device_id, device_key).to_string());
                }
                OperationStatus::Failed { status } => {
                    return Err(ProvisionError::Unassigned { status });
                }
                OperationStatus::InProgress { retry_after } => {
                    let delay = retry_after.unwrap_or(DEFAULT_POLL_INTERVAL);
                    debug!(attempt, ?delay, "Registration still in progress");
                    if attempt < self.max_attempts {
                        sleep_or_cancel(delay, cancel).await?;
                    }
                }
            }
        }
        Err(ProvisionError::RegistrationTimeout {
            attempts: self.max_attempts,
        })
    }

    /// Submits the registration, backing off while the service throttles.
    async fn submit(
        &self,
        request: &RegistrationRequest,
        cancel: &CancellationToken,
    ) -> ProvisionResult<String> {
        let mut backoff = build_exponential_backoff(&self.register_retry);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                result = self.api.register(request) => result,
            };
            match result {
                Err(e) if e.is_throttled() && self.register_retry.allows(attempts) => {
                    let Some(delay) = backoff.next_backoff() else {
                        return Err(e);
                    };
                    warn!(attempt = attempts, ?delay, "Registration throttled, backing off");
                    sleep_or_cancel(delay, cancel).await?;
                }
                other => return other,
            }
        }
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> ProvisionResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
