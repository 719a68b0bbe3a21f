#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use fleetsim_core::{device::SimulatedModel, EngineContext, RunContext};
use fleetsim_error::{
    storage::StorageError, transport::TransportError, FSResult, ProvisionResult, StorageResult,
    TransportResult,
};
use fleetsim_models::{
    constants::SIMULATION_PREFIX, settings::SimulationConfig, DeviceModel, ObjectStore,
    Simulation, SimulationDeviceConfig, SimulationStatus, SimulationTarget,
};
use fleetsim_sdk::{
    C2dMessage, ConnectParams, DeviceClient, DeviceTransport, ErrorKind, ManagementApi,
    MethodHandler, MetricLabels, OperationStatus, RegistrationApi, RegistrationRequest,
    RegistrationState, SimulationMetrics, TelemetryMessage, TwinDocument,
};
use fleetsim_storage::{ConnectionCache, MemoryStore, Stores};
use serde_json::{json, Value};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Level;

pub const SIM_ID: &str = "sim1";
pub const TARGET_ID: &str = "tgt1";
pub const MODEL_ID: &str = "thermostat";
pub const HUB: &str = "hub1.azure-devices.net";
/// Label the connected-device gauge carries for [`HUB`]
pub const HUB_NAME: &str = "hub1";

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Default)]
pub struct TransportState {
    pub connects: AtomicUsize,
    /// Completed closes
    pub closes: AtomicUsize,
    /// Errors returned by the next connects, in order
    pub connect_errors: Mutex<VecDeque<TransportError>>,
    /// Number of upcoming sends that fail
    pub send_failures: AtomicUsize,
    pub send_delay: Mutex<Duration>,
    pub close_delay: Mutex<Duration>,
    pub sends: DashMap<String, usize>,
    pub messages: Mutex<Vec<(String, TelemetryMessage)>>,
    pub hosts: Mutex<Vec<String>>,
    pub reported: Mutex<Vec<(String, TwinDocument)>>,
    pub desired: DashMap<String, mpsc::Sender<TwinDocument>>,
    pub c2d: DashMap<String, mpsc::Sender<C2dMessage>>,
    pub methods: DashMap<(String, String), MethodHandler>,
}

impl TransportState {
    pub fn sends_for(&self, device_id: &str) -> usize {
        self.sends.get(device_id).map(|n| *n).unwrap_or(0)
    }

    pub fn total_sends(&self) -> usize {
        self.sends.iter().map(|e| *e.value()).sum()
    }
}

#[derive(Default)]
pub struct MockTransport {
    pub state: Arc<TransportState>,
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn connect(&self, params: ConnectParams) -> TransportResult<Arc<dyn DeviceClient>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.state.connect_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.state
            .hosts
            .lock()
            .unwrap()
            .push(params.connection.host_name.clone());
        Ok(Arc::new(MockClient {
            device_id: params.connection.device_id.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MockClient {
    device_id: String,
    state: Arc<TransportState>,
}

#[async_trait]
impl DeviceClient for MockClient {
    async fn send_event(&self, message: TelemetryMessage) -> TransportResult<()> {
        let delay = *self.state.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .state
            .send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::ConnectionClosed("use of closed network connection".into()));
        }
        *self.state.sends.entry(self.device_id.clone()).or_default() += 1;
        self.state
            .messages
            .lock()
            .unwrap()
            .push((self.device_id.clone(), message));
        Ok(())
    }

    async fn update_reported(&self, patch: TwinDocument) -> TransportResult<()> {
        self.state
            .reported
            .lock()
            .unwrap()
            .push((self.device_id.clone(), patch));
        Ok(())
    }

    async fn subscribe_desired(&self) -> TransportResult<mpsc::Receiver<TwinDocument>> {
        let (tx, rx) = mpsc::channel(8);
        self.state.desired.insert(self.device_id.clone(), tx);
        Ok(rx)
    }

    async fn unsubscribe_desired(&self) -> TransportResult<()> {
        self.state.desired.remove(&self.device_id);
        Ok(())
    }

    async fn register_method(&self, name: &str, handler: MethodHandler) -> TransportResult<()> {
        self.state
            .methods
            .insert((self.device_id.clone(), name.to_string()), handler);
        Ok(())
    }

    async fn unregister_method(&self, name: &str) -> TransportResult<()> {
        self.state
            .methods
            .remove(&(self.device_id.clone(), name.to_string()));
        Ok(())
    }

    async fn subscribe_c2d(&self) -> TransportResult<mpsc::Receiver<C2dMessage>> {
        let (tx, rx) = mpsc::channel(8);
        self.state.c2d.insert(self.device_id.clone(), tx);
        Ok(rx)
    }

    async fn unsubscribe_c2d(&self) -> TransportResult<()> {
        self.state.c2d.remove(&self.device_id);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let delay = *self.state.close_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Registration and management
// ============================================================================

pub struct MockRegistrationApi {
    pub registers: AtomicUsize,
    pub polls: AtomicUsize,
    /// In-progress answers before each registration is assigned
    pub in_progress: AtomicUsize,
    pub retry_after: Option<Duration>,
    pub hub: Mutex<String>,
    /// Status codes returned by the next register calls
    pub register_failures: Mutex<VecDeque<u16>>,
    pending: DashMap<String, usize>,
}

impl MockRegistrationApi {
    pub fn new(in_progress: usize, retry_after: Option<Duration>) -> Self {
        Self {
            registers: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            in_progress: AtomicUsize::new(in_progress),
            retry_after,
            hub: Mutex::new(HUB.to_string()),
            register_failures: Mutex::new(VecDeque::new()),
            pending: DashMap::new(),
        }
    }

    pub fn set_hub(&self, hub: &str) {
        *self.hub.lock().unwrap() = hub.to_string();
    }
}

#[async_trait]
impl RegistrationApi for MockRegistrationApi {
    async fn register(&self, request: &RegistrationRequest) -> ProvisionResult<String> {
        let n = self.registers.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.register_failures.lock().unwrap().pop_front() {
            return Err(fleetsim_error::provision::ProvisionError::Request {
                status,
                reason: "rejected".into(),
            });
        }
        assert!(request.sas_token.starts_with("SharedAccessSignature sr="));
        assert!(request.sas_token.ends_with("&skn=registration"));
        let operation_id = format!("op-{}-{n}", request.registration_id);
        self.pending.insert(operation_id.clone(), 0);
        Ok(operation_id)
    }

    async fn operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
    ) -> ProvisionResult<OperationStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut seen = self.pending.entry(operation_id.to_string()).or_insert(0);
        *seen += 1;
        if *seen <= self.in_progress.load(Ordering::SeqCst) {
            return Ok(OperationStatus::InProgress {
                retry_after: self.retry_after,
            });
        }
        Ok(OperationStatus::Assigned(RegistrationState {
            assigned_hub: self.hub.lock().unwrap().clone(),
            device_id: request.registration_id.clone(),
            status: "assigned".into(),
        }))
    }
}

#[derive(Default)]
pub struct MockManagement {
    pub deleted: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl ManagementApi for MockManagement {
    async fn delete_device(&self, _app_url: &str, app_token: &str, device_id: &str) -> FSResult<()> {
        assert_eq!(app_token, "SharedAccessSignature app-token");
        self.deleted.lock().unwrap().push(device_id.to_string());
        if self.fail {
            return Err("device not found".into());
        }
        Ok(())
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Default)]
pub struct RecordingMetrics {
    counters: DashMap<String, u64>,
    connected: DashMap<String, i64>,
    simulated: DashMap<String, u64>,
}

impl RecordingMetrics {
    fn bump(&self, name: &str) {
        *self.counters.entry(name.to_string()).or_default() += 1;
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.get(name).map(|n| *n).unwrap_or(0)
    }

    pub fn connected(&self, hub: &str) -> i64 {
        self.connected.get(hub).map(|n| *n).unwrap_or(0)
    }

    pub fn simulated(&self, model_id: &str) -> u64 {
        self.simulated.get(model_id).map(|n| *n).unwrap_or(0)
    }
}

impl SimulationMetrics for RecordingMetrics {
    fn simulated_devices(&self, labels: &MetricLabels, count: u64) {
        self.simulated.insert(labels.model_id.to_string(), count);
    }

    fn device_connected(&self, _labels: &MetricLabels, hub: &str) {
        *self.connected.entry(hub.to_string()).or_default() += 1;
    }

    fn device_disconnected(&self, _labels: &MetricLabels, hub: &str) {
        *self.connected.entry(hub.to_string()).or_default() -= 1;
    }

    fn connect_failure(&self, _labels: &MetricLabels, kind: ErrorKind) {
        self.bump(&format!("connect_failure:{kind}"));
    }

    fn failover(&self, _labels: &MetricLabels) {
        self.bump("failover");
    }

    fn provision_success(&self, _labels: &MetricLabels, _latency: Duration) {
        self.bump("provision_success");
    }

    fn provision_failure(&self, _labels: &MetricLabels, kind: ErrorKind) {
        self.bump(&format!("provision_failure:{kind}"));
    }

    fn telemetry_batch_success(&self, _labels: &MetricLabels, _latency: Duration) {
        self.bump("telemetry_batch_success");
    }

    fn telemetry_batch_skipped(&self, _labels: &MetricLabels) {
        self.bump("telemetry_batch_skipped");
    }

    fn telemetry_message_success(&self, _labels: &MetricLabels, _latency: Duration, _bytes: usize, _points: usize) {
        self.bump("telemetry_message_success");
    }

    fn telemetry_message_failure(&self, _labels: &MetricLabels, kind: ErrorKind) {
        self.bump(&format!("telemetry_message_failure:{kind}"));
    }

    fn reported_props_success(&self, _labels: &MetricLabels, _latency: Duration) {
        self.bump("reported_props_success");
    }

    fn reported_props_skipped(&self, _labels: &MetricLabels) {
        self.bump("reported_props_skipped");
    }

    fn twin_update_success(&self, _labels: &MetricLabels, _latency: Duration) {
        self.bump("twin_update_success");
    }

    fn command_success(&self, _labels: &MetricLabels) {
        self.bump("command_success");
    }
}

// ============================================================================
// Store that remembers every simulation status written
// ============================================================================

#[derive(Default)]
pub struct StatusLogStore {
    inner: MemoryStore,
    pub statuses: Mutex<Vec<SimulationStatus>>,
    /// Writes of a simulation carrying this status are rejected
    pub reject_status: Mutex<Option<SimulationStatus>>,
}

#[async_trait]
impl ObjectStore for StatusLogStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.inner.list(prefix).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        if key.starts_with(SIMULATION_PREFIX) {
            if let Ok(simulation) = serde_json::from_slice::<Simulation>(&value) {
                if *self.reject_status.lock().unwrap() == Some(simulation.status) {
                    return Err(StorageError::StoreUnavailable);
                }
                self.statuses.lock().unwrap().push(simulation.status);
            }
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn thermostat_document() -> Value {
    json!([
        {
            "@id": "dtmi:com:example:Thermostat;1",
            "@type": "Interface",
            "contents": [
                {"@type": "Telemetry", "name": "temperature", "schema": "double"},
                {"@type": "Telemetry", "name": "location", "schema": "geopoint"},
                {"@type": "Property", "name": "targetTemperature", "schema": "double", "writable": true},
                {"@type": "Property", "name": "serialNumber", "schema": "string"},
                {"@type": "Command", "name": "reboot", "commandType": "synchronous"},
                {"@type": "Command", "name": "refresh"}
            ]
        }
    ])
}

pub fn target() -> SimulationTarget {
    SimulationTarget {
        id: TARGET_ID.into(),
        name: "Load target".into(),
        provisioning_url: "global.azure-devices-provisioning.net".into(),
        id_scope: "0ne000ABC".into(),
        master_key: "dGhpcyBpcyBhIHRlc3QgbWFzdGVyIGtleSBmb3IgZmxlZXRzaW0=".into(),
        app_url: "app.azureiotcentral.com".into(),
        app_token: "SharedAccessSignature app-token".into(),
    }
}

pub fn simulation(overrides: Value) -> Simulation {
    let mut base = json!({
        "id": SIM_ID,
        "name": "Load test",
        "targetId": TARGET_ID,
        "status": "ready",
        "waveGroupCount": 1,
        "waveGroupInterval": 0,
        "telemetryBatchSize": 1,
        "telemetryInterval": 5,
        "reportedPropertyInterval": 60,
    });
    if let (Some(base), Some(overrides)) = (base.as_object_mut(), overrides.as_object()) {
        for (k, v) in overrides {
            base.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(base).unwrap()
}

pub fn config() -> SimulationConfig {
    SimulationConfig {
        enable_reported_props: false,
        ..Default::default()
    }
}

pub struct Harness {
    pub engine: EngineContext,
    pub stores: Stores,
    pub log: Arc<StatusLogStore>,
    pub transport: Arc<MockTransport>,
    pub registration: Arc<MockRegistrationApi>,
    pub management: Arc<MockManagement>,
    pub metrics: Arc<RecordingMetrics>,
}

impl Harness {
    pub fn new(config: SimulationConfig, registration: MockRegistrationApi) -> Self {
        Self::with_management(config, registration, MockManagement::default())
    }

    pub fn with_management(
        config: SimulationConfig,
        registration: MockRegistrationApi,
        management: MockManagement,
    ) -> Self {
        init_tracing();
        let log = Arc::new(StatusLogStore::default());
        let stores = Stores::new(Arc::clone(&log) as Arc<dyn ObjectStore>);
        let cache = ConnectionCache::new(stores.clone(), 10_000, Duration::from_secs(600));
        let transport = Arc::new(MockTransport::default());
        let registration = Arc::new(registration);
        let management = Arc::new(management);
        let metrics = Arc::new(RecordingMetrics::default());
        let engine = EngineContext::new(
            config,
            cache,
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            Arc::clone(&registration) as Arc<dyn RegistrationApi>,
            Arc::clone(&management) as Arc<dyn ManagementApi>,
            Arc::clone(&metrics) as Arc<dyn SimulationMetrics>,
        );
        Self {
            engine,
            stores,
            log,
            transport,
            registration,
            management,
            metrics,
        }
    }

    /// Stores the target, the thermostat model, `simulation` and one device
    /// config per `(config_id, count)`.
    pub async fn seed(&self, simulation: &Simulation, configs: &[(&str, usize)]) {
        self.stores.set_target(&target()).await.unwrap();
        self.stores
            .set_device_model(&DeviceModel {
                id: MODEL_ID.into(),
                name: "Thermostat".into(),
                capability_model: thermostat_document(),
            })
            .await
            .unwrap();
        self.stores.set_simulation(simulation).await.unwrap();
        for (id, count) in configs {
            self.stores
                .set_device_config(&SimulationDeviceConfig {
                    id: id.to_string(),
                    simulation_id: simulation.id.clone(),
                    model_id: MODEL_ID.into(),
                    device_count: *count,
                })
                .await
                .unwrap();
        }
    }

    pub fn run_context(&self, simulation: Simulation) -> RunContext {
        RunContext {
            engine: self.engine.clone(),
            simulation,
            target: target(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn statuses(&self) -> Vec<SimulationStatus> {
        self.log.statuses.lock().unwrap().clone()
    }
}

pub fn thermostat_model() -> Arc<SimulatedModel> {
    let stored = DeviceModel {
        id: MODEL_ID.into(),
        name: "Thermostat".into(),
        capability_model: thermostat_document(),
    };
    Arc::new(SimulatedModel {
        schema: stored.schema().unwrap(),
        model_id: stored.model_id(),
        labels: MetricLabels::new(SIM_ID, TARGET_ID, MODEL_ID),
        id: stored.id,
    })
}

/// Yields to the runtime until `condition` holds, panicking after `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in {limit:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
