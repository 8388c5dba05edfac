//! Digitizer capability interface and device configuration.
//!
//! The control plane never depends on a concrete driver. Everything it needs from
//! the hardware goes through [`Digitizer`], whose methods take `&self` so a single
//! `Arc<dyn Digitizer>` can be shared between the readout supervisor and its worker.
//! Drivers use interior mutability for their connection state.
//!
//! # Available Implementations
//!
//! - [`mock::MockDigitizer`] - simulated SIS3316 that synthesizes event records

pub mod mock;

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Number of physical input channels.
pub const CHANNEL_COUNT: u8 = 16;

/// Channels per FPGA group.
pub const CHANNELS_PER_GROUP: u8 = 4;

/// Module identity and health as reported after connecting or stopping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Module id register
    pub module_id: String,
    /// Serial number
    pub serial: u32,
    /// Board temperature in degrees Celsius
    pub temperature_c: f64,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module id: {}, serial: {}, temp: {:.1} \u{2103}",
            self.module_id, self.serial, self.temperature_c
        )
    }
}

/// Hardware capabilities used by the readout supervisor and worker.
#[async_trait]
pub trait Digitizer: Send + Sync {
    /// Open the connection. May fail while the device is powered off.
    async fn connect(&self) -> AppResult<()>;

    /// Close the connection.
    async fn close(&self) -> AppResult<()>;

    /// Read module id, serial number and temperature.
    async fn identity(&self) -> AppResult<DeviceIdentity>;

    /// Write a configuration file's settings to the device registers.
    async fn apply_config(&self, config: &DeviceConfig) -> AppResult<()>;

    /// Prepare channel numbers and event formats for readout. Returns the device
    /// status flag; `false` means the device reported a problem but is usable.
    async fn configure(&self) -> AppResult<bool>;

    /// Start accepting triggers.
    async fn arm(&self) -> AppResult<()>;

    /// Stop accepting triggers.
    async fn disarm(&self) -> AppResult<()>;

    /// Reset the timestamp counter.
    async fn clear_timestamp(&self) -> AppResult<()>;

    /// Swap memory banks so stale data is not read out.
    async fn flush_memory(&self) -> AppResult<()>;

    /// Append the raw event bytes currently available for `channel` to `buf`,
    /// reading at most `max_bytes`. Returns the number of bytes appended; zero
    /// means nothing is available yet.
    async fn read_stream(&self, channel: u8, buf: &mut Vec<u8>, max_bytes: usize) -> AppResult<usize>;
}

/// JSON device configuration.
///
/// The top-level `channels`, `triggers` and `groups` objects are keyed by decimal
/// channel or group index. Their contents are device specific and passed through
/// untouched. Unknown top-level keys are preserved as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Per-channel settings (gain, flags, event format mask)
    pub channels: BTreeMap<String, Map<String, Value>>,
    /// Per-channel trigger settings (threshold)
    pub triggers: BTreeMap<String, Map<String, Value>>,
    /// Per-group settings (raw window, gate window)
    pub groups: BTreeMap<String, Map<String, Value>>,
    /// Anything else found at the top level
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceConfig {
    /// Read and validate a configuration file.
    ///
    /// # Errors
    ///
    /// - [`DaqError::Resource`] if the file cannot be read.
    /// - [`DaqError::Json`] if it does not match the schema.
    /// - [`DaqError::InvalidDeviceConfig`] if an index key is malformed or out of range.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| DaqError::resource(path, e))?;
        Self::from_json(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_json(text: &str) -> AppResult<Self> {
        let config: DeviceConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every section is keyed by an index in range.
    pub fn validate(&self) -> AppResult<()> {
        let groups = CHANNEL_COUNT / CHANNELS_PER_GROUP;
        for (section, entries, limit) in [
            ("channels", &self.channels, CHANNEL_COUNT),
            ("triggers", &self.triggers, CHANNEL_COUNT),
            ("groups", &self.groups, groups),
        ] {
            for key in entries.keys() {
                match key.parse::<u8>() {
                    Ok(index) if index < limit => {}
                    _ => {
                        return Err(DaqError::InvalidDeviceConfig(format!(
                            "'{section}' key '{key}' is not an index in 0..{limit}"
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Settings object of one channel.
    pub fn channel(&self, channel: u8) -> Option<&Map<String, Value>> {
        self.channels.get(&channel.to_string())
    }

    /// Event format mask of `channel`; bit 0 enables peak height readout.
    pub fn event_format_mask(&self, channel: u8) -> u32 {
        self.channel(channel)
            .and_then(|c| c.get("event_format_mask"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// Raw waveform window of the group containing `channel`, in samples.
    pub fn raw_window(&self, channel: u8) -> u32 {
        let group = channel / CHANNELS_PER_GROUP;
        self.groups
            .get(&group.to_string())
            .and_then(|g| g.get("raw_window"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// Serialize as indented JSON for the per-run snapshot.
    pub fn to_pretty_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
