/*!
 * @file logger.rs
 * @brief Structured logging: line logger + tracing bridge
 */

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tracing::{Level, Subscriber};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO "),
            LogLevel::Warning => write!(f, "WARN "),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE | Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warning,
            Level::ERROR => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayLogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub pid: u32,
    pub message: String,
}

impl RelayLogEvent {
    pub fn new(level: LogLevel, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            pid: std::process::id(),
            message,
        }
    }

    pub fn format_compact(&self) -> String {
        let symbol = match self.level {
            LogLevel::Debug => "•",
            LogLevel::Info => "✓",
            LogLevel::Warning => "⚠",
            LogLevel::Error => "✗",
        };

        format!(
            "{} {} {} : relaydb [{}]",
            symbol,
            self.pid,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.message
        )
    }
}

#[derive(Clone)]
pub struct RelayLogger {
    level: LogLevel,
}

impl RelayLogger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level >= self.level {
            let event = RelayLogEvent::new(level, message.to_string());
            eprintln!("{}", event.format_compact());
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

static GLOBAL_LOGGER: Mutex<Option<RelayLogger>> = Mutex::new(None);

pub fn init_logger(level: LogLevel) {
    let mut global = GLOBAL_LOGGER.lock().unwrap();
    *global = Some(RelayLogger::new(level));
}

pub fn get_logger() -> Option<RelayLogger> {
    GLOBAL_LOGGER.lock().unwrap().clone()
}

#[macro_export]
macro_rules! relaydb_debug {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.debug(&format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! relaydb_info {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.info(&format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! relaydb_warn {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.warning(&format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! relaydb_error {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.error(&format!($($arg)*));
        }
    };
}

/// Bridges `tracing` events (anything using `RUST_LOG`/`EnvFilter`) into the
/// line logger above, so library code that logs via `tracing::info!` and
/// call sites using `relaydb_info!` end up on the same output.
pub struct RelayTracingLayer;

impl<S> tracing_subscriber::Layer<S> for RelayTracingLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        let level = LogLevel::from(*metadata.level());

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .unwrap_or_else(|| metadata.name().to_string());

        if let Some(logger) = get_logger() {
            logger.log(level, &message);
        }
    }
}

#[derive(Default)]
struct LogVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for LogVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

pub fn init_tracing_logger(level: LogLevel) -> Result<(), Box<dyn std::error::Error>> {
    init_logger(level);

    let filter = match level {
        LogLevel::Debug => EnvFilter::new("debug"),
        LogLevel::Info => EnvFilter::new("info"),
        LogLevel::Warning => EnvFilter::new("warn"),
        LogLevel::Error => EnvFilter::new("error"),
    };

    Registry::default()
        .with(filter)
        .with(RelayTracingLayer)
        .init();

    Ok(())
}

pub fn process_uptime_secs(start: SystemTime) -> u64 {
    start
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(since_epoch)
                .saturating_sub(since_epoch)
                .as_secs()
        })
        .unwrap_or(0)
}
