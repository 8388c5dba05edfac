//! Parser worker: follows one growing data file and publishes histogram snapshots.
//!
//! The worker waits for its file to appear, then decodes events in fill windows.
//! At the end of each window the private histograms are updated and their state
//! is published to three depth-one slots (time counts, time bin edges and ADC
//! counts). Reaching the end of the file only ends the current window; the worker
//! keeps following the file until it is cancelled.

use crate::config::LivePlotSettings;
use crate::decoder::DecoderFactory;
use crate::error::{AppResult, DaqError};
use crate::histogram::{Histogram, TimeHistogram};
use crate::slot::{snapshot_slot, SlotReceiver, SlotSender};
use std::fs::File;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Events decoded between cooperative yields to the scheduler.
const YIELD_EVERY: u64 = 4096;

/// Producer halves of a worker's snapshot slots.
#[derive(Debug)]
pub struct SnapshotSenders {
    /// Per-second event counts
    pub time_counts: SlotSender<Vec<u64>>,
    /// Second boundaries matching `time_counts`
    pub time_edges: SlotSender<Vec<i64>>,
    /// ADC spectrum counts
    pub adc_counts: SlotSender<Vec<u64>>,
}

/// Consumer halves of a worker's snapshot slots.
#[derive(Debug)]
pub struct SnapshotReceivers {
    /// Per-second event counts
    pub time_counts: SlotReceiver<Vec<u64>>,
    /// Second boundaries matching `time_counts`
    pub time_edges: SlotReceiver<Vec<i64>>,
    /// ADC spectrum counts
    pub adc_counts: SlotReceiver<Vec<u64>>,
}

/// Create the three slots of one worker.
pub fn snapshot_channels() -> (SnapshotSenders, SnapshotReceivers) {
    let (time_counts_tx, time_counts_rx) = snapshot_slot();
    let (time_edges_tx, time_edges_rx) = snapshot_slot();
    let (adc_counts_tx, adc_counts_rx) = snapshot_slot();
    (
        SnapshotSenders {
            time_counts: time_counts_tx,
            time_edges: time_edges_tx,
            adc_counts: adc_counts_tx,
        },
        SnapshotReceivers {
            time_counts: time_counts_rx,
            time_edges: time_edges_rx,
            adc_counts: adc_counts_rx,
        },
    )
}

/// Summary returned when a worker stops.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerReport {
    /// File the worker followed
    pub path: PathBuf,
    /// Events decoded
    pub events: u64,
    /// Fill windows completed
    pub windows: u64,
    /// Snapshots replaced before the display drained them
    pub superseded: u64,
}

/// Follows one file and publishes its histograms.
pub struct ParserWorker {
    path: PathBuf,
    settings: LivePlotSettings,
    factory: Arc<dyn DecoderFactory>,
    slots: SnapshotSenders,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ParserWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserWorker")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ParserWorker {
    /// Create a worker for `path`. Nothing happens until [`run`](Self::run).
    pub fn new(
        path: impl Into<PathBuf>,
        settings: LivePlotSettings,
        factory: Arc<dyn DecoderFactory>,
        slots: SnapshotSenders,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            path: path.into(),
            settings,
            factory,
            slots,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// On cancellation the current window is filled and published once more
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a record fails to decode.
    pub async fn run(self) -> AppResult<WorkerReport> {
        let mut report = WorkerReport {
            path: self.path.clone(),
            ..WorkerReport::default()
        };

        let Some(file) = self.wait_for_file().await? else {
            debug!(path = %self.path.display(), "Cancelled before the file appeared");
            return Ok(report);
        };
        info!(path = %self.path.display(), "File opened");

        let mut decoder = self.factory.open(file)?;
        let mut time_hist = TimeHistogram::new(self.settings.time_growth_chunk);
        let mut adc_hist = Histogram::new(
            self.settings.adc_min,
            self.settings.adc_max,
            self.settings.adc_bins,
        )?;
        let rate = self.settings.sampling_rate_hz;

        loop {
            let deadline = Instant::now() + self.settings.fill_window();
            let mut times = Vec::new();
            let mut peaks = Vec::new();
            let mut cancelled = false;

            while Instant::now() < deadline {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                match decoder.next_event()? {
                    Some(event) => {
                        times.push(event.timestamp as f64 / rate);
                        if let Some(peak) = event.peak {
                            peaks.push(f64::from(peak));
                        }
                        report.events += 1;
                        if report.events % YIELD_EVERY == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = self.cancel.cancelled() => cancelled = true,
                            _ = sleep(self.settings.eof_backoff()) => {}
                        }
                        break;
                    }
                }
            }

            if !times.is_empty() {
                time_hist.fill(&times);
            }
            if !peaks.is_empty() {
                adc_hist.fill(&peaks);
            }
            let open = self.publish(
                &time_hist,
                !times.is_empty(),
                &adc_hist,
                !peaks.is_empty(),
                &mut report,
            );
            report.windows += 1;

            if cancelled || !open {
                info!(
                    path = %self.path.display(),
                    events = report.events,
                    windows = report.windows,
                    "Parser stopped"
                );
                return Ok(report);
            }
        }
    }

    /// Poll until the file exists. `None` if cancelled first.
    async fn wait_for_file(&self) -> AppResult<Option<File>> {
        loop {
            match File::open(&self.path) {
                Ok(file) => return Ok(Some(file)),
                Err(e) if e.kind() == IoErrorKind::NotFound => {
                    trace!(path = %self.path.display(), "Waiting for file");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = sleep(self.settings.file_poll()) => {}
                    }
                }
                Err(e) => return Err(DaqError::resource(&self.path, e)),
            }
        }
    }

    /// Publish whatever changed. Returns `false` once the display side is gone.
    fn publish(
        &self,
        time_hist: &TimeHistogram,
        time_changed: bool,
        adc_hist: &Histogram,
        adc_changed: bool,
        report: &mut WorkerReport,
    ) -> bool {
        let mut results = Vec::with_capacity(3);
        if time_changed {
            results.push(self.slots.time_counts.try_publish(time_hist.counts().to_vec()));
            results.push(self.slots.time_edges.try_publish(time_hist.bin_edges()));
        }
        if adc_changed {
            results.push(self.slots.adc_counts.try_publish(adc_hist.counts().to_vec()));
        }

        let mut open = true;
        for result in results {
            match result {
                Ok(()) => {}
                Err(DaqError::SnapshotDropped) => {
                    report.superseded += 1;
                    trace!(path = %self.path.display(), "Undrained snapshot replaced");
                }
                Err(_) => open = false,
            }
        }
        open
    }
}
