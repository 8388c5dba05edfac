//! Mock Digitizer
//!
//! Simulated SIS3316 for running the readout server and tests without hardware.
//! All timing uses `tokio::time`, so tests with a paused clock are deterministic.
//!
//! # Behavior
//!
//! - Connecting fails a configurable number of times before it succeeds
//! - While armed, every channel produces events at a Poisson rate (default 2 kHz)
//! - Records follow the real layout ([`crate::decoder`]); the peak block and raw
//!   samples are included according to the applied [`DeviceConfig`]
//! - Timestamps count 250 MHz ticks since the last `clear_timestamp`

use crate::decoder::{encode_event, Event};
use crate::error::{AppResult, DaqError};
use crate::hardware::{DeviceConfig, DeviceIdentity, Digitizer, CHANNEL_COUNT};
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

const CLOCK_HZ: f64 = 250_000_000.0;
const MAX_RAW_SAMPLES: u32 = 2048;

// =============================================================================
// Acquisition state
// =============================================================================

#[derive(Debug)]
struct Acquisition {
    clock_zero: Instant,
    next_tick: [u64; CHANNEL_COUNT as usize],
    rng: StdRng,
}

impl Acquisition {
    fn new(seed: u64) -> Self {
        Self {
            clock_zero: Instant::now(),
            next_tick: [0; CHANNEL_COUNT as usize],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn now_ticks(&self) -> u64 {
        (self.clock_zero.elapsed().as_secs_f64() * CLOCK_HZ) as u64
    }

    fn interval_ticks(&mut self, rate_hz: f64) -> u64 {
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        ((-u.ln() / rate_hz) * CLOCK_HZ).max(1.0) as u64
    }

    /// 60% of events in a line around 8000, the rest flat background.
    fn peak_height(&mut self) -> u16 {
        if self.rng.gen_bool(0.6) {
            let spread: f64 = (0..4).map(|_| self.rng.gen_range(-60.0..60.0)).sum();
            (8000.0 + spread) as u16
        } else {
            self.rng.gen_range(0..16384)
        }
    }
}

// =============================================================================
// MockDigitizer
// =============================================================================

/// Simulated SIS3316 digitizer.
///
/// # Example
///
/// ```rust,ignore
/// let device = MockDigitizer::new().with_connect_failures(2);
/// assert!(device.connect().await.is_err());
/// ```
#[derive(Debug)]
pub struct MockDigitizer {
    host: String,
    port: u16,
    event_rate_hz: f64,
    seed: u64,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    connected: AtomicBool,
    armed: AtomicBool,
    fail_next_read: AtomicBool,
    config: Arc<RwLock<Option<DeviceConfig>>>,
    acquisition: Arc<Mutex<Acquisition>>,
}

impl MockDigitizer {
    /// Create a mock at the default device address that connects on first try.
    pub fn new() -> Self {
        Self::with_address("192.168.1.100", 1234)
    }

    /// Create a mock reporting the given address.
    pub fn with_address(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            event_rate_hz: 2000.0,
            seed: 0x3316,
            connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            fail_next_read: AtomicBool::new(false),
            config: Arc::new(RwLock::new(None)),
            acquisition: Arc::new(Mutex::new(Acquisition::new(0x3316))),
        }
    }

    /// Fail the next `failures` connection attempts.
    pub fn with_connect_failures(self, failures: u32) -> Self {
        self.connect_failures.store(failures, Ordering::SeqCst);
        self
    }

    /// Mean event rate per channel.
    pub fn with_event_rate(mut self, rate_hz: f64) -> Self {
        self.event_rate_hz = rate_hz.max(f64::MIN_POSITIVE);
        self
    }

    /// Seed of the event generator, reset on every `clear_timestamp`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Make the next `read_stream` call fail, simulating a lost link.
    pub fn fail_next_read(&self) {
        self.fail_next_read.store(true, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Whether the last connection attempt succeeded and `close` was not called.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the device accepts triggers.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// The most recently applied configuration.
    pub async fn applied_config(&self) -> Option<DeviceConfig> {
        self.config.read().await.clone()
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DaqError::Device(format!(
                "{}:{} is not connected",
                self.host, self.port
            )))
        }
    }
}

impl Default for MockDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Digitizer for MockDigitizer {
    async fn connect(&self) -> AppResult<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        // Simulated UDP handshake
        sleep(Duration::from_millis(5)).await;

        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            return Err(DaqError::Device(format!(
                "no response from {}:{}",
                self.host, self.port
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(host = %self.host, port = self.port, "MockDigitizer: connected");
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        self.armed.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        debug!("MockDigitizer: closed");
        Ok(())
    }

    async fn identity(&self) -> AppResult<DeviceIdentity> {
        self.ensure_connected()?;
        let jitter = self.acquisition.lock().await.rng.gen_range(-0.5..0.5);
        Ok(DeviceIdentity {
            module_id: "3316".to_string(),
            serial: u32::from(self.port),
            temperature_c: 38.0 + jitter,
        })
    }

    async fn apply_config(&self, config: &DeviceConfig) -> AppResult<()> {
        self.ensure_connected()?;
        // Register writes
        sleep(Duration::from_millis(20)).await;
        *self.config.write().await = Some(config.clone());
        info!(
            channels = config.channels.len(),
            groups = config.groups.len(),
            "MockDigitizer: configuration applied"
        );
        Ok(())
    }

    async fn configure(&self) -> AppResult<bool> {
        self.ensure_connected()?;
        let configured = self.config.read().await.is_some();
        if !configured {
            warn!("MockDigitizer: configure called before any configuration was applied");
        }
        Ok(configured)
    }

    async fn arm(&self) -> AppResult<()> {
        self.ensure_connected()?;
        self.armed.store(true, Ordering::SeqCst);
        debug!("MockDigitizer: armed");
        Ok(())
    }

    async fn disarm(&self) -> AppResult<()> {
        self.ensure_connected()?;
        self.armed.store(false, Ordering::SeqCst);
        debug!("MockDigitizer: disarmed");
        Ok(())
    }

    async fn clear_timestamp(&self) -> AppResult<()> {
        self.ensure_connected()?;
        *self.acquisition.lock().await = Acquisition::new(self.seed);
        Ok(())
    }

    async fn flush_memory(&self) -> AppResult<()> {
        self.ensure_connected()?;
        let mut acq = self.acquisition.lock().await;
        let now = acq.now_ticks();
        acq.next_tick = [now; CHANNEL_COUNT as usize];
        Ok(())
    }

    async fn read_stream(&self, channel: u8, buf: &mut Vec<u8>, max_bytes: usize) -> AppResult<usize> {
        self.ensure_connected()?;
        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Device(format!(
                "read of channel {channel} timed out"
            )));
        }
        if channel >= CHANNEL_COUNT {
            return Err(DaqError::ChannelOutOfRange(i64::from(channel)));
        }
        if !self.is_armed() {
            return Ok(0);
        }

        let (with_peak, raw_samples) = match self.config.read().await.as_ref() {
            Some(config) => (
                config.event_format_mask(channel) & 1 != 0,
                config.raw_window(channel).min(MAX_RAW_SAMPLES),
            ),
            None => (true, 0),
        };

        let mut acq = self.acquisition.lock().await;
        let now = acq.now_ticks();
        let start = buf.len();
        let slot = usize::from(channel);
        while acq.next_tick[slot] <= now {
            let waveform = (raw_samples > 0).then(|| {
                (0..raw_samples)
                    .map(|_| acq.rng.gen_range(100..140))
                    .collect::<Vec<u16>>()
            });
            let event = Event {
                timestamp: acq.next_tick[slot],
                channel: u16::from(channel),
                peak: with_peak.then(|| acq.peak_height()),
                waveform,
            };
            let record = encode_event(&event);
            if buf.len() - start + record.len() > max_bytes {
                break;
            }
            buf.extend_from_slice(&record);
            let step = acq.interval_ticks(self.event_rate_hz);
            acq.next_tick[slot] += step;
        }
        Ok(buf.len() - start)
    }
}
