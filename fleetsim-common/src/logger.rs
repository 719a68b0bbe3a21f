use arc_swap::ArcSwap;
use fleetsim_error::{FSError, FSResult};
use std::sync::Arc;
use tracing::{subscriber::set_global_default, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::DynFilterFn,
    fmt::{self},
    layer::SubscriberExt,
    Layer, Registry,
};

const LOG_FILE_NAME: &str = "fleetsim.log";

/// Parses a configured level name such as `info` or `DEBUG`.
pub fn parse_level(level: &str) -> FSResult<Level> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| FSError::ConfigurationError(format!("unknown log level '{level}'")))
}

/// Console plus daily-rolling file logging with a level that can change at runtime.
pub struct Logger {
    level: Arc<ArcSwap<Level>>,
    _file_guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(level: Option<Level>) -> Self {
        Logger {
            level: Arc::new(ArcSwap::from_pointee(level.unwrap_or(Level::INFO))),
            _file_guard: None,
        }
    }

    #[inline]
    pub fn set_level(&self, new_level: Level) {
        self.level.store(Arc::new(new_level));
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        **self.level.load()
    }

    /// Installs the global subscriber writing to stdout and to `{log_dir}/fleetsim.log.*`.
    pub fn initialize(&mut self, log_dir: &str) -> FSResult<()> {
        let file_appender = rolling::daily(log_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        self._file_guard = Some(guard);

        let console_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| metadata.level() <= &**level.load())
        };
        let file_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| metadata.level() <= &**level.load())
        };

        let console_layer = {
            #[cfg(debug_assertions)]
            let layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(true)
                .with_line_number(true);

            #[cfg(not(debug_assertions))]
            let layer = fmt::layer().with_writer(std::io::stdout).with_target(false);

            layer.with_filter(console_filter)
        };

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        let subscriber = Registry::default().with(console_layer).with(file_layer);
        set_global_default(subscriber)
            .map_err(|e| FSError::InitializationError(format!("failed to set logger: {e}")))?;
        Ok(())
    }
}
