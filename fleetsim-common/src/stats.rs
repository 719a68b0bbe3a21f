//! In-process statistics sink with a periodic summary log line.

use dashmap::DashMap;
use fleetsim_error::{FSError, FSResult};
use fleetsim_sdk::{ErrorKind, MetricLabels, SimulationMetrics};
use hdrhistogram::Histogram;
use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Highest latency tracked, one minute in microseconds
const MAX_LATENCY_US: u64 = 60_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub simulated_devices: u64,
    pub connected_devices: i64,
    pub connect_failures: u64,
    pub failovers: u64,
    pub provisioned: u64,
    pub provision_failures: u64,
    pub telemetry_batches: u64,
    pub telemetry_batches_skipped: u64,
    pub messages_sent: u64,
    pub message_failures: u64,
    pub bytes_sent: u64,
    pub data_points_sent: u64,
    pub reported_props: u64,
    pub reported_props_failures: u64,
    pub reported_props_skipped: u64,
    pub twin_updates: u64,
    pub twin_update_failures: u64,
    pub commands: u64,
    pub telemetry_latency: LatencyStats,
    pub connect_latency: LatencyStats,
}

#[derive(Default)]
struct Counters {
    connect_failures: AtomicU64,
    failovers: AtomicU64,
    provisioned: AtomicU64,
    provision_failures: AtomicU64,
    telemetry_batches: AtomicU64,
    telemetry_batches_skipped: AtomicU64,
    messages_sent: AtomicU64,
    message_failures: AtomicU64,
    bytes_sent: AtomicU64,
    data_points_sent: AtomicU64,
    reported_props: AtomicU64,
    reported_props_failures: AtomicU64,
    reported_props_skipped: AtomicU64,
    twin_updates: AtomicU64,
    twin_update_failures: AtomicU64,
    commands: AtomicU64,
}

/// Aggregates every event across simulations.
///
/// Latencies land in HDR histograms; failures are additionally tallied by
/// error kind.
pub struct StatsMetrics {
    counters: Counters,
    simulated: DashMap<MetricLabels, u64>,
    connected: AtomicI64,
    errors: DashMap<&'static str, u64>,
    telemetry_latency: Mutex<Histogram<u64>>,
    connect_latency: Mutex<Histogram<u64>>,
}

impl StatsMetrics {
    pub fn new() -> FSResult<Self> {
        let histogram = || {
            Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, 3)
                .map_err(|e| FSError::InitializationError(format!("latency histogram: {e}")))
        };
        Ok(Self {
            counters: Counters::default(),
            simulated: DashMap::new(),
            connected: AtomicI64::new(0),
            errors: DashMap::new(),
            telemetry_latency: Mutex::new(histogram()?),
            connect_latency: Mutex::new(histogram()?),
        })
    }

    fn failure(&self, kind: ErrorKind) {
        *self.errors.entry(kind.as_str()).or_default() += 1;
    }

    fn record(histogram: &Mutex<Histogram<u64>>, latency: Duration) {
        if let Ok(mut histogram) = histogram.lock() {
            histogram.saturating_record(latency.as_micros().min(u128::from(MAX_LATENCY_US)) as u64);
        }
    }

    fn latency(histogram: &Mutex<Histogram<u64>>) -> LatencyStats {
        let Ok(histogram) = histogram.lock() else {
            return LatencyStats::default();
        };
        if histogram.is_empty() {
            return LatencyStats::default();
        }
        let ms = |us: u64| us as f64 / 1000.0;
        LatencyStats {
            count: histogram.len(),
            p50_ms: ms(histogram.value_at_quantile(0.50)),
            p99_ms: ms(histogram.value_at_quantile(0.99)),
            max_ms: ms(histogram.max()),
        }
    }

    /// Failure counts by error kind label.
    pub fn errors(&self) -> Vec<(&'static str, u64)> {
        let mut errors: Vec<_> = self.errors.iter().map(|e| (*e.key(), *e.value())).collect();
        errors.sort_unstable();
        errors
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            simulated_devices: self.simulated.iter().map(|e| *e.value()).sum(),
            connected_devices: self.connected.load(Ordering::Relaxed),
            connect_failures: load(&c.connect_failures),
            failovers: load(&c.failovers),
            provisioned: load(&c.provisioned),
            provision_failures: load(&c.provision_failures),
            telemetry_batches: load(&c.telemetry_batches),
            telemetry_batches_skipped: load(&c.telemetry_batches_skipped),
            messages_sent: load(&c.messages_sent),
            message_failures: load(&c.message_failures),
            bytes_sent: load(&c.bytes_sent),
            data_points_sent: load(&c.data_points_sent),
            reported_props: load(&c.reported_props),
            reported_props_failures: load(&c.reported_props_failures),
            reported_props_skipped: load(&c.reported_props_skipped),
            twin_updates: load(&c.twin_updates),
            twin_update_failures: load(&c.twin_update_failures),
            commands: load(&c.commands),
            telemetry_latency: Self::latency(&self.telemetry_latency),
            connect_latency: Self::latency(&self.connect_latency),
        }
    }

    /// Logs a summary every `interval` until `cancel` fires.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        if interval.is_zero() {
            return;
        }
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut previous = stats.snapshot();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let current = stats.snapshot();
                        let rate = (current.messages_sent - previous.messages_sent) as f64
                            / interval.as_secs_f64();
                        info!(
                            simulated = current.simulated_devices,
                            connected = current.connected_devices,
                            messages = current.messages_sent,
                            msg_per_sec = %format!("{rate:.1}"),
                            failures = current.message_failures,
                            skipped = current.telemetry_batches_skipped,
                            failovers = current.failovers,
                            provisioned = current.provisioned,
                            p50_ms = current.telemetry_latency.p50_ms,
                            p99_ms = current.telemetry_latency.p99_ms,
                            "📊 Simulation statistics"
                        );
                        previous = current;
                    }
                }
            }
        });
    }
}

impl SimulationMetrics for StatsMetrics {
    fn simulated_devices(&self, labels: &MetricLabels, count: u64) {
        if count == 0 {
            self.simulated.remove(labels);
        } else {
            self.simulated.insert(labels.clone(), count);
        }
    }

    fn device_connected(&self, _labels: &MetricLabels, _hub: &str) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    fn device_disconnected(&self, _labels: &MetricLabels, _hub: &str) {
        self.connected.fetch_sub(1, Ordering::Relaxed);
    }

    fn connect_latency(&self, _labels: &MetricLabels, latency: Duration) {
        Self::record(&self.connect_latency, latency);
    }

    fn connect_failure(&self, _labels: &MetricLabels, kind: ErrorKind) {
        self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.failure(kind);
    }

    fn failover(&self, _labels: &MetricLabels) {
        self.counters.failovers.fetch_add(1, Ordering::Relaxed);
    }

    fn provision_success(&self, _labels: &MetricLabels, _latency: Duration) {
        self.counters.provisioned.fetch_add(1, Ordering::Relaxed);
    }

    fn provision_failure(&self, _labels: &MetricLabels, kind: ErrorKind) {
        self.counters.provision_failures.fetch_add(1, Ordering::Relaxed);
        self.failure(kind);
    }

    fn telemetry_batch_success(&self, _labels: &MetricLabels, _latency: Duration) {
        self.counters.telemetry_batches.fetch_add(1, Ordering::Relaxed);
    }

    fn telemetry_batch_skipped(&self, _labels: &MetricLabels) {
        self.counters
            .telemetry_batches_skipped
            .fetch_add(1, Ordering::Relaxed);
    }

    fn telemetry_message_success(
        &self,
        _labels: &MetricLabels,
        latency: Duration,
        bytes: usize,
        data_points: usize,
    ) {
        let c = &self.counters;
        c.messages_sent.fetch_add(1, Ordering::Relaxed);
        c.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        c.data_points_sent
            .fetch_add(data_points as u64, Ordering::Relaxed);
        Self::record(&self.telemetry_latency, latency);
    }

    fn telemetry_message_failure(&self, _labels: &MetricLabels, kind: ErrorKind) {
        self.counters.message_failures.fetch_add(1, Ordering::Relaxed);
        self.failure(kind);
    }

    fn reported_props_success(&self, _labels: &MetricLabels, _latency: Duration) {
        self.counters.reported_props.fetch_add(1, Ordering::Relaxed);
    }

    fn reported_props_failure(&self, _labels: &MetricLabels, kind: ErrorKind) {
        self.counters
            .reported_props_failures
            .fetch_add(1, Ordering::Relaxed);
        self.failure(kind);
    }

    fn reported_props_skipped(&self, _labels: &MetricLabels) {
        self.counters
            .reported_props_skipped
            .fetch_add(1, Ordering::Relaxed);
    }

    fn twin_update_success(&self, _labels: &MetricLabels, _latency: Duration) {
        self.counters.twin_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn twin_update_failure(&self, _labels: &MetricLabels, kind: ErrorKind) {
        self.counters
            .twin_update_failures
            .fetch_add(1, Ordering::Relaxed);
        self.failure(kind);
    }

    fn command_success(&self, _labels: &MetricLabels) {
        self.counters.commands.fetch_add(1, Ordering::Relaxed);
    }
}
