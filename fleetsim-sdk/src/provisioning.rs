use async_trait::async_trait;
use fleetsim_error::ProvisionResult;
use std::time::Duration;

/// Everything a registration call needs, already signed.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    /// Host of the provisioning service
    pub endpoint: String,
    pub id_scope: String,
    pub registration_id: String,
    pub model_id: String,
    /// `SharedAccessSignature ...` authorization header value
    pub sas_token: String,
}

/// Assignment reported by a finished registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationState {
    pub assigned_hub: String,
    pub device_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// Still running; the service may suggest when to ask again
    InProgress { retry_after: Option<Duration> },
    Assigned(RegistrationState),
    /// Finished without an assignment (`failed`, `disabled`, ...)
    Failed { status: String },
}

/// Register-then-poll identity registration service.
#[async_trait]
pub trait RegistrationApi: Send + Sync + 'static {
    /// Submits the registration and returns the operation id to poll.
    async fn register(&self, request: &RegistrationRequest) -> ProvisionResult<String>;

    async fn operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
    ) -> ProvisionResult<OperationStatus>;
}
