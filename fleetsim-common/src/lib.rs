//! Process runtime for fleetsim: settings, logging, metrics sinks, the object
//! store and the simulation controller, wired together once at startup.
mod logger;
pub mod metrics;
pub mod stats;

pub use fleetsim_error::{FSError, FSResult};
pub use logger::{parse_level, Logger};

use fleetsim_core::{EngineContext, SimulationController};
use fleetsim_hub::{DpsClient, ManagementClient, MqttTransport};
use fleetsim_models::{ObjectStore, Settings};
use fleetsim_sdk::SimulationMetrics;
use fleetsim_storage::{ConnectionCache, MemoryStore, Stores};
use metrics::{init_meter_provider, FanoutMetrics, OtelMetrics};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use stats::StatsMetrics;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
#[cfg(windows)]
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Level};

const CONNECTION_CACHE_CAPACITY: u64 = 100_000;
const CONNECTION_CACHE_TTI: Duration = Duration::from_secs(30 * 60);
const SNAPSHOT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct AppContext {
    settings: Settings,
    logger: Logger,
    store: Arc<MemoryStore>,
    stats: Arc<StatsMetrics>,
    meter_provider: Option<SdkMeterProvider>,
    controller: Arc<SimulationController>,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
}

impl AppContext {
    /// Loads settings, installs the logger, opens the store and builds the controller.
    ///
    /// Every stored simulation is reset to `Ready` since no simulator survives a restart.
    pub async fn init(config_path: Option<&str>) -> FSResult<Self> {
        let settings = Settings::new(config_path)?;

        let mut logger = Logger::new(Some(parse_level(&settings.general.log_level)?));
        logger.initialize(&settings.general.log_dir)?;
        Self::build(settings, logger).await
    }

    #[instrument(name = "init-app", skip_all)]
    async fn build(settings: Settings, logger: Logger) -> FSResult<Self> {
        let shutdown_token = CancellationToken::new();
        let store = Arc::new(Self::open_store(&settings).await?);
        store.spawn_flusher(SNAPSHOT_FLUSH_INTERVAL, shutdown_token.child_token());
        let stores = Stores::new(Arc::clone(&store) as Arc<dyn ObjectStore>);
        let cache = ConnectionCache::new(stores, CONNECTION_CACHE_CAPACITY, CONNECTION_CACHE_TTI);

        let stats = Arc::new(StatsMetrics::new()?);
        stats.spawn_reporter(
            Duration::from_millis(settings.metrics.summary_interval_ms),
            shutdown_token.child_token(),
        );
        let mut sinks: Vec<Arc<dyn SimulationMetrics>> = vec![Arc::clone(&stats) as _];
        let meter_provider = if settings.metrics.enabled {
            let provider = init_meter_provider(&settings.metrics)?;
            sinks.push(OtelMetrics::new(&provider));
            info!(endpoint = %settings.metrics.endpoint, "Metrics export enabled");
            Some(provider)
        } else {
            None
        };

        let simulation = &settings.simulation;
        let registration = DpsClient::new(simulation.registration_attempt_timeout())?;
        let management = ManagementClient::new(simulation.command_timeout())?;
        let engine = EngineContext::new(
            simulation.clone(),
            cache,
            Arc::new(MqttTransport::new()),
            Arc::new(registration),
            Arc::new(management),
            Arc::new(FanoutMetrics::new(sinks)),
        );
        let controller = Arc::new(SimulationController::new(engine, shutdown_token.child_token()));
        controller.reset_simulation_status().await?;
        info!("Simulation engine initialized");

        Ok(Self {
            settings,
            logger,
            store,
            stats,
            meter_provider,
            controller,
            shutting_down: AtomicBool::new(false),
            shutdown_token,
        })
    }

    async fn open_store(settings: &Settings) -> FSResult<MemoryStore> {
        let path = settings.general.data_file.trim();
        if path.is_empty() {
            return Ok(MemoryStore::new());
        }
        Ok(MemoryStore::open(path).await?)
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[inline]
    pub fn controller(&self) -> &Arc<SimulationController> {
        &self.controller
    }

    #[inline]
    pub fn stores(&self) -> &Stores {
        &self.controller.engine().stores
    }

    #[inline]
    pub fn stats(&self) -> &Arc<StatsMetrics> {
        &self.stats
    }

    #[inline]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    #[inline]
    pub fn change_log_level(&self, level: Level) {
        self.logger.set_level(level);
    }

    /// Runs `work` until it completes or a shutdown signal arrives, then shuts down.
    pub async fn run<F>(&self, work: F) -> FSResult<()>
    where
        F: Future<Output = FSResult<()>>,
    {
        let result = tokio::select! {
            result = work => result,
            _ = self.wait_for_signal() => Ok(()),
        };
        self.graceful_shutdown().await?;
        result
    }

    async fn wait_for_signal(&self) {
        let shutdown_token = self.shutdown_token.clone();

        #[cfg(unix)]
        {
            let (Ok(mut sigterm), Ok(mut sigint)) = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) else {
                warn!("Failed to register signal handlers, waiting for shutdown token only");
                shutdown_token.cancelled().await;
                return;
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT signal");
                }
                _ = shutdown_token.cancelled() => {}
            }
        }

        #[cfg(windows)]
        {
            tokio::select! {
                _ = ctrl_c() => {
                    info!("Received ctrl-c signal");
                }
                _ = shutdown_token.cancelled() => {}
            }
        }
    }

    /// Stops every simulation, flushes the store and the metric exporter. Later calls are no-ops.
    #[instrument(name = "graceful-shutdown", skip_all)]
    pub async fn graceful_shutdown(&self) -> FSResult<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("🛑 Starting graceful shutdown...");

        self.controller.stop_all().await;
        self.shutdown_token.cancel();
        self.store.flush().await?;
        if let Some(provider) = &self.meter_provider {
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "Metric provider shutdown failed");
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            messages = snapshot.messages_sent,
            failures = snapshot.message_failures,
            failovers = snapshot.failovers,
            provisioned = snapshot.provisioned,
            "✅ Graceful shutdown completed"
        );
        Ok(())
    }
}
