//! Configuration System using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. An optional TOML file (`--config daq.toml`)
//! 3. Environment variables prefixed with `SIS3316_`, `__` separating sections
//! 4. Command-line flags, applied by each binary after loading
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SIS3316_APPLICATION__LOG_LEVEL=debug
//! SIS3316_DEVICE__MAX_RETRIES=5
//! SIS3316_LIVE_PLOT__ADC_BINS=4096
//! SIS3316_LIVE_PLOT__FILES_POLICY=reconcile
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sis3316_daq::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! println!("Device at {}:{}", settings.device.host, settings.device.port);
//! # Ok::<(), sis3316_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SIS3316_";

/// Top-level settings shared by all binaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging and process-level settings
    pub application: ApplicationSettings,
    /// Digitizer connection settings
    pub device: DeviceSettings,
    /// Message channel endpoints
    pub endpoints: EndpointSettings,
    /// Output file naming
    pub output: OutputSettings,
    /// Live histogram pipeline
    pub live_plot: LivePlotSettings,
    /// Readout worker tuning
    pub readout: ReadoutSettings,
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Digitizer connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Digitizer IP address
    pub host: String,
    /// Digitizer UDP port
    pub port: u16,
    /// Connection attempts gate; the attempt at index `max_retries - 1` is fatal
    pub max_retries: u32,
    /// Fixed delay between connection attempts
    pub retry_delay_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 1234,
            max_retries: 10,
            retry_delay_ms: 3000,
        }
    }
}

impl DeviceSettings {
    /// Delay between connection attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// TCP endpoints for the two message channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Readout server command endpoint
    pub command_addr: String,
    /// Live plotter control endpoint
    pub plot_addr: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            command_addr: "127.0.0.1:5560".to_string(),
            plot_addr: "127.0.0.1:5561".to_string(),
        }
    }
}

/// Naming of acquisition output files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Binary output filename prefix
    pub file_head: String,
    /// Binary output extension
    pub file_ext: String,
    /// Run attribute log written in the output folder
    pub attr_file: String,
    /// Device configuration snapshot written at stop
    pub config_snapshot: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            file_head: "ch".to_string(),
            file_ext: ".dat".to_string(),
            attr_file: "attr.txt".to_string(),
            config_snapshot: "config.json".to_string(),
        }
    }
}

/// What a `FILES` message does to workers of files it no longer lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesPolicy {
    /// Keep them running, detached from display, until the next stop
    #[default]
    Retain,
    /// Stop them immediately
    Reconcile,
}

/// Live histogram pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivePlotSettings {
    /// Display tick driving `poll`
    pub display_tick_ms: u64,
    /// Length of one parser fill window
    pub fill_window_ms: u64,
    /// Poll interval while waiting for a file to appear
    pub file_poll_ms: u64,
    /// Sleep after reaching the end of a file
    pub eof_backoff_ms: u64,
    /// Device clock in ticks per second
    pub sampling_rate_hz: f64,
    /// ADC histogram lower bound
    pub adc_min: f64,
    /// ADC histogram upper bound
    pub adc_max: f64,
    /// ADC histogram bin count
    pub adc_bins: usize,
    /// Bins added per side when the time histogram grows
    pub time_growth_chunk: usize,
    /// MAW test buffer length in words, needed to skip MAW samples
    pub maw_test_words: usize,
    /// Hard timeout for a cancelled parser before it is aborted
    pub worker_shutdown_timeout_ms: u64,
    /// Handling of files dropped by a `FILES` message
    pub files_policy: FilesPolicy,
}

impl Default for LivePlotSettings {
    fn default() -> Self {
        Self {
            display_tick_ms: 500,
            fill_window_ms: 800,
            file_poll_ms: 500,
            eof_backoff_ms: 500,
            sampling_rate_hz: 250_000_000.0,
            adc_min: 0.0,
            adc_max: 16384.0,
            adc_bins: 16384,
            time_growth_chunk: 100,
            maw_test_words: 0,
            worker_shutdown_timeout_ms: 2000,
            files_policy: FilesPolicy::Retain,
        }
    }
}

impl LivePlotSettings {
    /// Display tick period.
    pub fn display_tick(&self) -> Duration {
        Duration::from_millis(self.display_tick_ms)
    }

    /// Fill window length.
    pub fn fill_window(&self) -> Duration {
        Duration::from_millis(self.fill_window_ms)
    }

    /// File existence poll interval.
    pub fn file_poll(&self) -> Duration {
        Duration::from_millis(self.file_poll_ms)
    }

    /// Sleep after end-of-file.
    pub fn eof_backoff(&self) -> Duration {
        Duration::from_millis(self.eof_backoff_ms)
    }

    /// Parser shutdown hard timeout.
    pub fn worker_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_shutdown_timeout_ms)
    }
}

/// Readout worker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutSettings {
    /// Bytes requested from the device per channel read
    pub chunk_bytes: usize,
    /// Sleep when no channel produced data
    pub idle_poll_ms: u64,
    /// Hard timeout for a stopped worker before it is aborted
    pub worker_shutdown_timeout_ms: u64,
}

impl Default for ReadoutSettings {
    fn default() -> Self {
        Self {
            chunk_bytes: 1024 * 1024,
            idle_poll_ms: 50,
            worker_shutdown_timeout_ms: 2000,
        }
    }
}

impl ReadoutSettings {
    /// Idle poll interval.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Worker shutdown hard timeout.
    pub fn worker_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_shutdown_timeout_ms)
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and `SIS3316_` environment
    /// variables, then validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or the environment cannot be extracted into
    /// [`Settings`], or if validation fails.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Configuration`] with a descriptive message for the first
    /// invalid value found.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let live = &self.live_plot;
        for (name, value) in [
            ("live_plot.display_tick_ms", live.display_tick_ms),
            ("live_plot.fill_window_ms", live.fill_window_ms),
            ("live_plot.file_poll_ms", live.file_poll_ms),
        ] {
            if value == 0 {
                return Err(DaqError::Configuration(format!("{name} must be > 0")));
            }
        }
        if live.adc_bins == 0 {
            return Err(DaqError::Configuration("live_plot.adc_bins must be > 0".into()));
        }
        if !(live.adc_max > live.adc_min) {
            return Err(DaqError::Configuration(format!(
                "live_plot.adc_max ({}) must be greater than adc_min ({})",
                live.adc_max, live.adc_min
            )));
        }
        if !(live.sampling_rate_hz > 0.0) {
            return Err(DaqError::Configuration(
                "live_plot.sampling_rate_hz must be positive".into(),
            ));
        }
        if live.time_growth_chunk == 0 {
            return Err(DaqError::Configuration(
                "live_plot.time_growth_chunk must be > 0".into(),
            ));
        }
        if self.output.file_head.is_empty() {
            return Err(DaqError::Configuration("output.file_head cannot be empty".into()));
        }
        if self.readout.chunk_bytes == 0 {
            return Err(DaqError::Configuration("readout.chunk_bytes must be > 0".into()));
        }
        Ok(())
    }
}
