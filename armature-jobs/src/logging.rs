//! Logging setup for job servers.
//!
//! Drivers log through `tracing`. Embedding applications usually install
//! their own subscriber; standalone workers can call [`init`] to get one
//! configured from the environment:
//!
//! - `ARMATURE_JOBS_LOG` - filter directive (`info`, `armature_jobs=debug`, ...)
//! - `ARMATURE_JOBS_LOG_FORMAT` - `pretty`, `compact` or `json`
//! - `ARMATURE_JOBS_DEBUG=1` - shorthand for a `debug` filter

use std::env;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{JobsError, JobsResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Multi-line human readable output
    Pretty,
    /// Single-line output
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

impl Format {
    /// Parse a format name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

/// Subscriber configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub filter: String,
    pub format: Format,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: Format::default(),
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Read the configuration from `ARMATURE_JOBS_*` variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(filter) = get("ARMATURE_JOBS_LOG").filter(|f| !f.trim().is_empty()) {
            config.filter = filter;
        }
        if get("ARMATURE_JOBS_DEBUG").is_some_and(|v| matches!(v.as_str(), "1" | "true")) {
            config.filter = "debug".to_string();
        }
        if let Some(format) = get("ARMATURE_JOBS_LOG_FORMAT").and_then(|f| Format::parse(&f)) {
            config.format = format;
        }
        // json consumers don't want escape codes
        config.ansi = config.format != Format::Json;

        config
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }
}

/// Install a global subscriber built from `config`.
///
/// Fails if the filter does not parse or a global subscriber is already set.
pub fn init(config: &LogConfig) -> JobsResult<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| JobsError::Config(format!("log filter `{}`: {e}", config.filter)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        Format::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(config.ansi))
            .try_init(),
        Format::Compact => registry
            .with(fmt::layer().compact().with_ansi(config.ansi))
            .try_init(),
        Format::Json => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init(),
    };

    result.map_err(|e| JobsError::Config(format!("logging already initialized: {e}")))
}

/// [`init`] with [`LogConfig::from_env`].
pub fn init_from_env() -> JobsResult<()> {
    init(&LogConfig::from_env())
}
