//! Diagnostic logging setup
//!
//! Events go to stderr so stdout only carries the tunnel's own status lines.
//! The filter comes from `--log-level`, then `PODFORWARD_LOG`, then `warn`.

use tracing_subscriber::EnvFilter;

use crate::cli::LogFormat;
use crate::errors::{Result, TunnelError};

/// Environment variable holding a filter directive, e.g. `podforward=debug`
pub const LOG_ENV: &str = "PODFORWARD_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Build the filter for an explicit level or the environment
pub fn filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| TunnelError::Config(format!("Invalid log level '{}': {}", directive, e))),
        None => Ok(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Install the global subscriber
pub fn init(level: Option<&str>, format: LogFormat) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(level)?)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| TunnelError::Config(format!("Failed to initialize logging: {}", e)))
}
