//! Tracing subscriber setup shared by the binaries.

use crate::config::{ApplicationSettings, LogFormat};
use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level so a single run can be made more
/// verbose without touching the config file.
pub fn init_tracing(settings: &ApplicationSettings) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| DaqError::Configuration(format!("Invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = match settings.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| DaqError::Configuration(format!("Failed to install tracing subscriber: {e}")))
}
