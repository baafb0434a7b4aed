//! Logging configuration and setup.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{CommonError, Result};

/// Directives appended to every level-derived filter. The HTTP stack is chatty at debug.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include span events (enter, exit).
    pub include_span_events: bool,
    /// Custom filter string (e.g., "swcache_sw=debug,reqwest=warn").
    pub filter: Option<String>,
    /// Write to stderr so stdout stays free for command output.
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            include_location: false,
            include_span_events: false,
            filter: None,
            stderr: true,
        }
    }
}

impl LogConfig {
    /// Configuration for a command-line run: warnings only unless verbose.
    pub fn cli(verbose: bool) -> Self {
        Self {
            level: if verbose { Level::DEBUG } else { Level::WARN },
            include_location: verbose,
            ..Default::default()
        }
    }

    /// Create a production configuration.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Build the filter: explicit filter, then `RUST_LOG`, then the level.
    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(format!("{},{}", self.level, QUIET_DEPENDENCIES));
        match self.filter {
            Some(ref custom) => EnvFilter::try_new(custom).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Initialize logging with the given configuration.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let filter = config.env_filter();

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match (config.format, config.stderr) {
        (LogFormat::Pretty, stderr) => {
            let layer = fmt::layer()
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_span_events(span_events);
            if stderr {
                registry.with(layer.with_writer(std::io::stderr)).try_init()
            } else {
                registry.with(layer).try_init()
            }
        }
        (LogFormat::Compact, stderr) => {
            let layer = fmt::layer()
                .compact()
                .with_target(true)
                .with_line_number(config.include_location)
                .with_span_events(span_events);
            if stderr {
                registry.with(layer.with_writer(std::io::stderr)).try_init()
            } else {
                registry.with(layer).try_init()
            }
        }
        (LogFormat::Json, stderr) => {
            let layer = fmt::layer().json().with_span_events(span_events);
            if stderr {
                registry.with(layer.with_writer(std::io::stderr)).try_init()
            } else {
                registry.with(layer).try_init()
            }
        }
    };

    result.map_err(|e| CommonError::config_with_source("logging already initialized", e))
}
