//! Process-wide tracing setup shared by the financing binaries.
//!
//! Logs are JSON lines by default so they can be shipped as-is; set
//! `FINFLOW_LOG_FORMAT=compact` for human-readable output in development.
//! Filtering follows `RUST_LOG` (default `info`).

use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "FINFLOW_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compact" | "pretty" | "text" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }

    pub fn from_env() -> Self {
        std::env::var(ENV_LOG_FORMAT)
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }
}

/// Install the global subscriber using the environment's settings.
///
/// Safe to call more than once; only the first call installs anything.
/// Returns whether this call did.
pub fn init() -> bool {
    init_with(LogFormat::from_env())
}

pub fn init_with(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init()
            .is_ok(),
        LogFormat::Compact => builder.compact().try_init().is_ok(),
    }
}
