use fleetsim_error::{provision::ProvisionError, transport::TransportError, FSError};
use std::{fmt, sync::Arc, time::Duration};

/// Label set attached to every simulation metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricLabels {
    pub simulation_id: Arc<str>,
    pub target_id: Arc<str>,
    pub model_id: Arc<str>,
}

impl MetricLabels {
    pub fn new(simulation_id: &str, target_id: &str, model_id: &str) -> Self {
        Self {
            simulation_id: Arc::from(simulation_id),
            target_id: Arc::from(target_id),
            model_id: Arc::from(model_id),
        }
    }
}

/// Bounded error label set for failure counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Throttled,
    ConnectionClosed,
    NotAuthorized,
    Timeout,
    NetworkError,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Throttled => "throttled",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::NotAuthorized => "not authorized",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network error",
            ErrorKind::Other => "other",
        }
    }

    pub fn from_transport(err: &TransportError) -> Self {
        match err {
            TransportError::Throttled(_) => ErrorKind::Throttled,
            TransportError::ConnectionClosed(_) | TransportError::NotConnected => {
                ErrorKind::ConnectionClosed
            }
            TransportError::Unauthorized(_) => ErrorKind::NotAuthorized,
            TransportError::Timeout { .. } => ErrorKind::Timeout,
            TransportError::Network(_) | TransportError::ServerUnavailable(_) => {
                ErrorKind::NetworkError
            }
            other => Self::from_text(&other.to_string()),
        }
    }

    pub fn from_provision(err: &ProvisionError) -> Self {
        match err {
            e if e.is_throttled() => ErrorKind::Throttled,
            ProvisionError::Request { status: 401, .. } | ProvisionError::Request { status: 403, .. } => {
                ErrorKind::NotAuthorized
            }
            ProvisionError::RegistrationTimeout { .. } => ErrorKind::Timeout,
            ProvisionError::Network(_) => ErrorKind::NetworkError,
            other => Self::from_text(&other.to_string()),
        }
    }

    pub fn from_error(err: &FSError) -> Self {
        match err {
            FSError::Transport(e) => Self::from_transport(e),
            FSError::Provision(e) => Self::from_provision(e),
            FSError::Timeout(_) => ErrorKind::Timeout,
            other => Self::from_text(&other.to_string()),
        }
    }

    /// Pattern match on an error message for errors without a typed origin.
    pub fn from_text(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("429") || msg.contains("throttl") {
            ErrorKind::Throttled
        } else if msg.contains("use of closed")
            || msg.contains("forcibly closed")
            || msg.contains("connection closed")
            || msg.contains("connection reset")
        {
            ErrorKind::ConnectionClosed
        } else if msg.contains("not authorized") || msg.contains("unauthorized") {
            ErrorKind::NotAuthorized
        } else if msg.contains("deadline exceeded") || msg.contains("timed out") {
            ErrorKind::Timeout
        } else if msg.contains("tls") || msg.contains("network") || msg.contains("dns") {
            ErrorKind::NetworkError
        } else {
            ErrorKind::Other
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for the events the engine counts and times.
///
/// Every method defaults to a no-op so sinks only implement what they export.
/// Implementations must tolerate concurrent calls from many workers.
pub trait SimulationMetrics: Send + Sync + 'static {
    /// Size of the simulated population of a model, set at start and cleared at stop.
    fn simulated_devices(&self, _labels: &MetricLabels, _count: u64) {}

    fn device_connected(&self, _labels: &MetricLabels, _hub: &str) {}

    fn device_disconnected(&self, _labels: &MetricLabels, _hub: &str) {}

    fn connect_latency(&self, _labels: &MetricLabels, _latency: Duration) {}

    fn connect_failure(&self, _labels: &MetricLabels, _kind: ErrorKind) {}

    fn failover(&self, _labels: &MetricLabels) {}

    fn provision_success(&self, _labels: &MetricLabels, _latency: Duration) {}

    fn provision_failure(&self, _labels: &MetricLabels, _kind: ErrorKind) {}

    fn telemetry_batch_success(&self, _labels: &MetricLabels, _latency: Duration) {}

    fn telemetry_batch_skipped(&self, _labels: &MetricLabels) {}

    fn telemetry_message_success(
        &self,
        _labels: &MetricLabels,
        _latency: Duration,
        _bytes: usize,
        _data_points: usize,
    ) {
    }

    fn telemetry_message_failure(&self, _labels: &MetricLabels, _kind: ErrorKind) {}

    fn reported_props_success(&self, _labels: &MetricLabels, _latency: Duration) {}

    fn reported_props_failure(&self, _labels: &MetricLabels, _kind: ErrorKind) {}

    fn reported_props_skipped(&self, _labels: &MetricLabels) {}

    fn twin_update_success(&self, _labels: &MetricLabels, _latency: Duration) {}

    fn twin_update_failure(&self, _labels: &MetricLabels, _kind: ErrorKind) {}

    fn command_success(&self, _labels: &MetricLabels) {}
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl SimulationMetrics for NoopMetrics {}
