use crate::domain::settings::LogSettings;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

pub struct LoggingGuard {
    // We need to keep this guard alive for logs to be flushed
    _guards: Vec<WorkerGuard>,
}

/// Receives one formatted log line.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Host-registered destinations for log output.
#[derive(Default)]
pub struct HostSinks {
    log: RwLock<Option<LogSink>>,
    error: RwLock<Option<LogSink>>,
}

impl HostSinks {
    /// Process-wide sinks used by the installed subscriber.
    pub fn global() -> Arc<HostSinks> {
        static GLOBAL: OnceLock<Arc<HostSinks>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(HostSinks::default())).clone()
    }

    pub fn set_log_sink(&self, sink: Option<LogSink>) {
        *self.log.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    pub fn set_error_sink(&self, sink: Option<LogSink>) {
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    fn emit(&self, level: Level, line: &str) {
        let slot = if level == Level::ERROR {
            &self.error
        } else {
            &self.log
        };
        let sink = slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink(line);
        }
    }
}

/// Forwards events to the host: errors to the error sink, the rest to the log sink.
pub struct HostLogLayer {
    sinks: Arc<HostSinks>,
}

impl HostLogLayer {
    pub fn new(sinks: Arc<HostSinks>) -> Self {
        Self { sinks }
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let line = format!(
            "[{}] {}: {}{}",
            metadata.level(),
            metadata.target(),
            visitor.message,
            visitor.fields
        );
        self.sinks.emit(*metadata.level(), &line);
    }
}

/// Install the process subscriber. A second call in the same process keeps
/// the first subscriber and only returns a fresh guard.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    // Parse log level
    let level_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Console layer
    let console_layer = if settings.console_logging_enabled {
        Some(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target)
                .with_ansi(settings.ansi_colors),
        )
    } else {
        None
    };

    // File layer
    let file_layer = if settings.file_logging_enabled {
        let rotation = match settings.rotation.to_lowercase().as_str() {
            "hourly" => tracing_appender::rolling::Rotation::HOURLY,
            "minutely" => tracing_appender::rolling::Rotation::MINUTELY,
            "never" => tracing_appender::rolling::Rotation::NEVER,
            _ => tracing_appender::rolling::Rotation::DAILY,
        };

        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            rotation,
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(level_filter)
        .with(HostLogLayer::new(HostSinks::global()))
        .with(console_layer)
        .with(file_layer)
        .try_init();

    match installed {
        Ok(()) => tracing::info!("Logging initialized successfully"),
        Err(e) => tracing::debug!("Logger already installed: {}", e),
    }

    Ok(LoggingGuard { _guards: guards })
}
