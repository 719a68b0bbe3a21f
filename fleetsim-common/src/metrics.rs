//! OpenTelemetry export of the simulation metrics.

use fleetsim_error::{FSError, FSResult};
use fleetsim_models::settings::Metrics;
use fleetsim_sdk::{ErrorKind, MetricLabels, SimulationMetrics};
use opentelemetry::{
    metrics::{Counter, Gauge, Histogram, Meter, MeterProvider, UpDownCounter},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use std::{sync::Arc, time::Duration};

const METER_NAME: &str = "fleetsim";

/// Builds the OTLP (gRPC) meter provider described by the `metrics` settings.
pub fn init_meter_provider(settings: &Metrics) -> FSResult<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&settings.endpoint)
        .build()
        .map_err(|e| FSError::InitializationError(format!("failed to create metric exporter: {e}")))?;

    let provider = SdkMeterProvider::builder()
        .with_reader(
            PeriodicReader::builder(exporter)
                .with_interval(Duration::from_millis(settings.export_interval))
                .build(),
        )
        .with_resource(
            Resource::builder()
                .with_service_name(settings.service_name.to_string())
                .build(),
        )
        .build();
    Ok(provider)
}

fn attributes(labels: &MetricLabels) -> [KeyValue; 3] {
    [
        KeyValue::new("simulation_id", labels.simulation_id.to_string()),
        KeyValue::new("target_id", labels.target_id.to_string()),
        KeyValue::new("model_id", labels.model_id.to_string()),
    ]
}

fn with(labels: &MetricLabels, key: &'static str, value: impl Into<String>) -> Vec<KeyValue> {
    let mut attrs = attributes(labels).to_vec();
    attrs.push(KeyValue::new(key, value.into()));
    attrs
}

fn millis(latency: Duration) -> f64 {
    latency.as_secs_f64() * 1000.0
}

/// Metrics sink recording through an OpenTelemetry meter.
///
/// Outcomes share one counter per operation, split by a `result` attribute
/// (`success`, `failure`, `skipped`); failures also carry `error_type`.
pub struct OtelMetrics {
    simulated_devices: Gauge<u64>,
    connected_devices: UpDownCounter<i64>,
    connect_latency: Histogram<f64>,
    connect_failures: Counter<u64>,
    failovers: Counter<u64>,
    provisions: Counter<u64>,
    provision_latency: Histogram<f64>,
    telemetry_batches: Counter<u64>,
    telemetry_batch_latency: Histogram<f64>,
    telemetry_messages: Counter<u64>,
    telemetry_latency: Histogram<f64>,
    telemetry_bytes: Counter<u64>,
    telemetry_data_points: Counter<u64>,
    reported_props: Counter<u64>,
    reported_props_latency: Histogram<f64>,
    twin_updates: Counter<u64>,
    twin_update_latency: Histogram<f64>,
    commands: Counter<u64>,
}

impl OtelMetrics {
    pub fn new(provider: &SdkMeterProvider) -> Arc<Self> {
        Arc::new(Self::from_meter(&provider.meter(METER_NAME)))
    }

    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            simulated_devices: meter
                .u64_gauge("fleetsim.devices.simulated")
                .with_description("Devices in running simulations")
                .build(),
            connected_devices: meter
                .i64_up_down_counter("fleetsim.devices.connected")
                .with_description("Connected devices per hub")
                .build(),
            connect_latency: meter
                .f64_histogram("fleetsim.connect.latency")
                .with_unit("ms")
                .build(),
            connect_failures: meter
                .u64_counter("fleetsim.connect.failures")
                .build(),
            failovers: meter
                .u64_counter("fleetsim.failovers")
                .with_description("Devices re-provisioned onto another endpoint")
                .build(),
            provisions: meter.u64_counter("fleetsim.provisions").build(),
            provision_latency: meter
                .f64_histogram("fleetsim.provision.latency")
                .with_unit("ms")
                .build(),
            telemetry_batches: meter.u64_counter("fleetsim.telemetry.batches").build(),
            telemetry_batch_latency: meter
                .f64_histogram("fleetsim.telemetry.batch.latency")
                .with_unit("ms")
                .build(),
            telemetry_messages: meter.u64_counter("fleetsim.telemetry.messages").build(),
            telemetry_latency: meter
                .f64_histogram("fleetsim.telemetry.latency")
                .with_unit("ms")
                .build(),
            telemetry_bytes: meter
                .u64_counter("fleetsim.telemetry.bytes")
                .with_unit("By")
                .build(),
            telemetry_data_points: meter
                .u64_counter("fleetsim.telemetry.data_points")
                .build(),
            reported_props: meter
                .u64_counter("fleetsim.reported_properties")
                .build(),
            reported_props_latency: meter
                .f64_histogram("fleetsim.reported_properties.latency")
                .with_unit("ms")
                .build(),
            twin_updates: meter.u64_counter("fleetsim.twin_updates").build(),
            twin_update_latency: meter
                .f64_histogram("fleetsim.twin_update.latency")
                .with_unit("ms")
                .build(),
            commands: meter.u64_counter("fleetsim.commands").build(),
        }
    }
}

impl SimulationMetrics for OtelMetrics {
    fn simulated_devices(&self, labels: &MetricLabels, count: u64) {
        self.simulated_devices.record(count, &attributes(labels));
    }

    fn device_connected(&self, labels: &MetricLabels, hub: &str) {
        self.connected_devices.add(1, &with(labels, "hub", hub));
    }

    fn device_disconnected(&self, labels: &MetricLabels, hub: &str) {
        self.connected_devices.add(-1, &with(labels, "hub", hub));
    }

    fn connect_latency(&self, labels: &MetricLabels, latency: Duration) {
        self.connect_latency.record(millis(latency), &attributes(labels));
    }

    fn connect_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        self.connect_failures
            .add(1, &with(labels, "error_type", kind.as_str()));
    }

    fn failover(&self, labels: &MetricLabels) {
        self.failovers.add(1, &attributes(labels));
    }

    fn provision_success(&self, labels: &MetricLabels, latency: Duration) {
        self.provisions.add(1, &with(labels, "result", "success"));
        self.provision_latency.record(millis(latency), &attributes(labels));
    }

    fn provision_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        let mut attrs = with(labels, "result", "failure");
        attrs.push(KeyValue::new("error_type", kind.as_str()));
        self.provisions.add(1, &attrs);
    }

    fn telemetry_batch_success(&self, labels: &MetricLabels, latency: Duration) {
        self.telemetry_batches.add(1, &with(labels, "result", "success"));
        self.telemetry_batch_latency
            .record(millis(latency), &attributes(labels));
    }

    fn telemetry_batch_skipped(&self, labels: &MetricLabels) {
        self.telemetry_batches.add(1, &with(labels, "result", "skipped"));
    }

    fn telemetry_message_success(
        &self,
        labels: &MetricLabels,
        latency: Duration,
        bytes: usize,
        data_points: usize,
    ) {
        let attrs = attributes(labels);
        self.telemetry_messages.add(1, &with(labels, "result", "success"));
        self.telemetry_latency.record(millis(latency), &attrs);
        self.telemetry_bytes.add(bytes as u64, &attrs);
        self.telemetry_data_points.add(data_points as u64, &attrs);
    }

    fn telemetry_message_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        let mut attrs = with(labels, "result", "failure");
        attrs.push(KeyValue::new("error_type", kind.as_str()));
        self.telemetry_messages.add(1, &attrs);
    }

    fn reported_props_success(&self, labels: &MetricLabels, latency: Duration) {
        self.reported_props.add(1, &with(labels, "result", "success"));
        self.reported_props_latency
            .record(millis(latency), &attributes(labels));
    }

    fn reported_props_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        let mut attrs = with(labels, "result", "failure");
        attrs.push(KeyValue::new("error_type", kind.as_str()));
        self.reported_props.add(1, &attrs);
    }

    fn reported_props_skipped(&self, labels: &MetricLabels) {
        self.reported_props.add(1, &with(labels, "result", "skipped"));
    }

    fn twin_update_success(&self, labels: &MetricLabels, latency: Duration) {
        self.twin_updates.add(1, &with(labels, "result", "success"));
        self.twin_update_latency
            .record(millis(latency), &attributes(labels));
    }

    fn twin_update_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        let mut attrs = with(labels, "result", "failure");
        attrs.push(KeyValue::new("error_type", kind.as_str()));
        self.twin_updates.add(1, &attrs);
    }

    fn command_success(&self, labels: &MetricLabels) {
        self.commands.add(1, &with(labels, "result", "success"));
    }
}

/// Forwards every event to each inner sink.
pub struct FanoutMetrics(Vec<Arc<dyn SimulationMetrics>>);

impl FanoutMetrics {
    pub fn new(sinks: Vec<Arc<dyn SimulationMetrics>>) -> Self {
        Self(sinks)
    }
}

impl SimulationMetrics for FanoutMetrics {
    fn simulated_devices(&self, labels: &MetricLabels, count: u64) {
        self.0.iter().for_each(|m| m.simulated_devices(labels, count));
    }

    fn device_connected(&self, labels: &MetricLabels, hub: &str) {
        self.0.iter().for_each(|m| m.device_connected(labels, hub));
    }

    fn device_disconnected(&self, labels: &MetricLabels, hub: &str) {
        self.0.iter().for_each(|m| m.device_disconnected(labels, hub));
    }

    fn connect_latency(&self, labels: &MetricLabels, latency: Duration) {
        self.0.iter().for_each(|m| m.connect_latency(labels, latency));
    }

    fn connect_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        self.0.iter().for_each(|m| m.connect_failure(labels, kind));
    }

    fn failover(&self, labels: &MetricLabels) {
        self.0.iter().for_each(|m| m.failover(labels));
    }

    fn provision_success(&self, labels: &MetricLabels, latency: Duration) {
        self.0.iter().for_each(|m| m.provision_success(labels, latency));
    }

    fn provision_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        self.0.iter().for_each(|m| m.provision_failure(labels, kind));
    }

    fn telemetry_batch_success(&self, labels: &MetricLabels, latency: Duration) {
        self.0
            .iter()
            .for_each(|m| m.telemetry_batch_success(labels, latency));
    }

    fn telemetry_batch_skipped(&self, labels: &MetricLabels) {
        self.0.iter().for_each(|m| m.telemetry_batch_skipped(labels));
    }

    fn telemetry_message_success(
        &self,
        labels: &MetricLabels,
        latency: Duration,
        bytes: usize,
        data_points: usize,
    ) {
        self.0
            .iter()
            .for_each(|m| m.telemetry_message_success(labels, latency, bytes, data_points));
    }

    fn telemetry_message_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        self.0
            .iter()
            .for_each(|m| m.telemetry_message_failure(labels, kind));
    }

    fn reported_props_success(&self, labels: &MetricLabels, latency: Duration) {
        self.0
            .iter()
            .for_each(|m| m.reported_props_success(labels, latency));
    }

    fn reported_props_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        self.0.iter().for_each(|m| m.reported_props_failure(labels, kind));
    }

    fn reported_props_skipped(&self, labels: &MetricLabels) {
        self.0.iter().for_each(|m| m.reported_props_skipped(labels));
    }

    fn twin_update_success(&self, labels: &MetricLabels, latency: Duration) {
        self.0.iter().for_each(|m| m.twin_update_success(labels, latency));
    }

    fn twin_update_failure(&self, labels: &MetricLabels, kind: ErrorKind) {
        self.0.iter().for_each(|m| m.twin_update_failure(labels, kind));
    }

    fn command_success(&self, labels: &MetricLabels) {
        self.0.iter().for_each(|m| m.command_success(labels));
    }
}
