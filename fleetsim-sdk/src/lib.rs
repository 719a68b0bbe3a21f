mod connection_string;
mod management;
mod metrics;
mod provisioning;
mod retry;
mod transport;

pub use connection_string::{ConnectionString, UNKNOWN_HUB};
pub use management::ManagementApi;
pub use metrics::{ErrorKind, MetricLabels, NoopMetrics, SimulationMetrics};
pub use provisioning::{OperationStatus, RegistrationApi, RegistrationRequest, RegistrationState};
pub use retry::{build_exponential_backoff, RetryPolicy};
pub use transport::{
    C2dMessage, ConnectParams, DeviceClient, DeviceTransport, MethodHandler, TelemetryMessage,
    TwinDocument,
};
