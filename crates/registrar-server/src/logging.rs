//! Process-wide tracing subscriber

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{Result, ServerError};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level, used when `RUST_LOG` is unset or empty
    pub level: Level,
    /// Emit JSON lines instead of text
    pub json: bool,
    /// Include file and line information
    pub file_info: bool,
    /// Log span enter/exit
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }
}

/// Filter from `RUST_LOG`-style directives, falling back to `level`
fn build_filter(level: Level, directives: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy(directives.unwrap_or_default())
}

/// Install the global subscriber
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(config.level, directives.as_deref());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let mut subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events);

    if config.file_info {
        subscriber = subscriber.with_file(true).with_line_number(true);
    }

    let installed = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| ServerError::Logging(e.to_string()))
}

/// Parse a log level name such as `debug` or `WARN`
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level)
        .map_err(|_| ServerError::Logging(format!("invalid log level: {}", level)))
}

/// Level selected by repeated `-v` flags
pub fn verbosity_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
