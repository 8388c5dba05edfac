//! Live-plot supervisor.
//!
//! Owns one parser worker per monitored file and decides which file feeds the
//! display. The display side calls [`LivePlotSupervisor::poll`] once per tick.
//! `poll` never blocks: it drains control messages, restarts workers when a new
//! file set arrived, and picks up whatever snapshots the displayed file's worker
//! has published since the last tick.
//!
//! Control messages arrive on an mpsc channel:
//!
//! - `FILES <name>...` replaces the monitored set and restarts workers on the
//!   next tick
//! - `DONE` stops every worker

use crate::config::{FilesPolicy, LivePlotSettings};
use crate::decoder::DecoderFactory;
use crate::error::{AppResult, DaqError};
use crate::histogram::Histogram;
use crate::messages::PlotterCommand;
use crate::parser::{snapshot_channels, ParserWorker, SnapshotReceivers, WorkerReport};
use futures::FutureExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Display data
// =============================================================================

/// New snapshots for the displayed file, as picked up by one poll.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DisplayUpdate {
    /// File the snapshots belong to
    pub path: PathBuf,
    /// Per-second counts with their edges, always a consistent pair
    pub time: Option<(Vec<u64>, Vec<i64>)>,
    /// ADC spectrum counts
    pub adc_counts: Option<Vec<u64>>,
}

impl DisplayUpdate {
    /// Whether anything new arrived.
    pub fn is_empty(&self) -> bool {
        self.time.is_none() && self.adc_counts.is_none()
    }
}

/// Latest histogram state shown for the displayed file.
///
/// Parts without a new snapshot keep their previous value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DisplayState {
    /// File currently shown
    pub path: Option<PathBuf>,
    /// Per-second counts
    pub time_counts: Vec<u64>,
    /// Second boundaries, one more than `time_counts`
    pub time_edges: Vec<i64>,
    /// ADC spectrum counts
    pub adc_counts: Vec<u64>,
}

impl DisplayState {
    /// Merge an update. Switching to another file starts from a blank state.
    pub fn apply(&mut self, update: &DisplayUpdate) {
        if self.path.as_deref() != Some(update.path.as_path()) {
            *self = DisplayState {
                path: Some(update.path.clone()),
                ..DisplayState::default()
            };
        }
        if let Some((counts, edges)) = &update.time {
            self.time_counts.clone_from(counts);
            self.time_edges.clone_from(edges);
        }
        if let Some(adc) = &update.adc_counts {
            self.adc_counts.clone_from(adc);
        }
    }

    /// Events in the time histogram.
    pub fn total_events(&self) -> u64 {
        self.time_counts.iter().sum()
    }
}

/// Bin edges of the ADC spectrum for `settings`.
pub fn adc_bin_edges(settings: &LivePlotSettings) -> AppResult<Vec<f64>> {
    Ok(Histogram::new(settings.adc_min, settings.adc_max, settings.adc_bins)?
        .bin_edges()
        .to_vec())
}

/// Receives display state once per tick with new data.
pub trait PlotSink: Send {
    /// Show `state`. `adc_edges` are the fixed ADC bin edges.
    fn render(&mut self, state: &DisplayState, adc_edges: &[f64]);
}

/// Sink that logs a summary line per update.
#[derive(Debug, Default)]
pub struct LogSink;

impl PlotSink for LogSink {
    fn render(&mut self, state: &DisplayState, adc_edges: &[f64]) {
        let peak_bin = state
            .adc_counts
            .iter()
            .enumerate()
            .max_by_key(|(_, count)| **count)
            .filter(|(_, count)| **count > 0)
            .and_then(|(i, _)| adc_edges.get(i).copied());
        let seconds = match (state.time_edges.first(), state.time_edges.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        };
        info!(
            file = %state.path.as_deref().unwrap_or(Path::new("")).display(),
            events = state.total_events(),
            adc_events = state.adc_counts.iter().sum::<u64>(),
            span_s = seconds,
            adc_mode = ?peak_bin,
            "Histogram update"
        );
    }
}

// =============================================================================
// Workers
// =============================================================================

#[derive(Debug)]
struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<AppResult<WorkerReport>>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and let a background reaper enforce the hard timeout.
    fn shutdown(self) {
        self.cancel.cancel();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.join());
            }
            Err(_) => self.task.abort(),
        }
    }

    /// Cancel and wait for the task, aborting it after the hard timeout.
    async fn join(self) {
        self.cancel.cancel();
        let abort = self.task.abort_handle();
        match timeout(self.shutdown_timeout, self.task).await {
            Ok(Ok(Ok(report))) => log_report(&report),
            Ok(Ok(Err(e))) => warn!(error = %e, "Parser ended with error"),
            Ok(Err(join_err)) if join_err.is_cancelled() => debug!("Parser task aborted"),
            Ok(Err(join_err)) => error!(error = %join_err, "Parser task panicked"),
            Err(_) => {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Parser did not stop in time, aborting"
                );
                abort.abort();
            }
        }
    }
}

fn log_report(report: &WorkerReport) {
    info!(
        path = %report.path.display(),
        events = report.events,
        windows = report.windows,
        superseded = report.superseded,
        "Parser finished"
    );
}

#[derive(Debug)]
struct MonitoredFile {
    path: PathBuf,
    worker: Option<WorkerHandle>,
    slots: Option<SnapshotReceivers>,
    pending_counts: Option<Vec<u64>>,
    pending_edges: Option<Vec<i64>>,
}

impl MonitoredFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            worker: None,
            slots: None,
            pending_counts: None,
            pending_edges: None,
        }
    }

    fn has_live_worker(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn attach(&mut self, worker: WorkerHandle, slots: SnapshotReceivers) {
        self.worker = Some(worker);
        self.slots = Some(slots);
        self.pending_counts = None;
        self.pending_edges = None;
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        self.slots = None;
    }

    /// Collect the last report of a finished worker.
    fn reap(&mut self) {
        if !self.worker.as_ref().is_some_and(WorkerHandle::is_finished) {
            return;
        }
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.task.now_or_never() {
            Some(Ok(Ok(report))) => log_report(&report),
            Some(Ok(Err(e))) => {
                error!(path = %self.path.display(), error = %e, "Parser stopped unexpectedly")
            }
            Some(Err(join_err)) => {
                error!(path = %self.path.display(), error = %join_err, "Parser task failed")
            }
            None => {}
        }
    }

    fn drain(&mut self) -> DisplayUpdate {
        let mut update = DisplayUpdate {
            path: self.path.clone(),
            ..DisplayUpdate::default()
        };
        let Some(slots) = &self.slots else {
            return update;
        };
        if let Some(counts) = slots.time_counts.try_take() {
            self.pending_counts = Some(counts);
        }
        if let Some(edges) = slots.time_edges.try_take() {
            self.pending_edges = Some(edges);
        }
        update.adc_counts = slots.adc_counts.try_take();

        // Forward the time histogram only when both halves belong together
        if let (Some(counts), Some(edges)) = (&self.pending_counts, &self.pending_edges) {
            if edges.len() == counts.len() + 1 {
                update.time = self.pending_counts.take().zip(self.pending_edges.take());
            }
        }
        update
    }
}

// =============================================================================
// LivePlotSupervisor
// =============================================================================

/// Supervises parser workers and feeds the display.
pub struct LivePlotSupervisor {
    settings: LivePlotSettings,
    factory: Arc<dyn DecoderFactory>,
    files: Vec<MonitoredFile>,
    detached: Vec<MonitoredFile>,
    displayed: Option<PathBuf>,
    restart_pending: bool,
    control: Option<mpsc::Receiver<PlotterCommand>>,
}

impl std::fmt::Debug for LivePlotSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePlotSupervisor")
            .field("files", &self.monitored())
            .field("displayed", &self.displayed)
            .field("restart_pending", &self.restart_pending)
            .finish_non_exhaustive()
    }
}

impl LivePlotSupervisor {
    /// Create a supervisor without any monitored file.
    pub fn new(settings: LivePlotSettings, factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            settings,
            factory,
            files: Vec::new(),
            detached: Vec::new(),
            displayed: None,
            restart_pending: false,
            control: None,
        }
    }

    /// Attach the control message receiver drained by `poll`.
    pub fn with_control(mut self, control: mpsc::Receiver<PlotterCommand>) -> Self {
        self.control = Some(control);
        self
    }

    /// Monitored files in order.
    pub fn monitored(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// File feeding the display.
    pub fn displayed(&self) -> Option<&Path> {
        self.displayed.as_deref()
    }

    /// Whether workers will be (re)started on the next poll.
    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    /// Number of monitored files with a running worker.
    pub fn live_workers(&self) -> usize {
        self.files.iter().filter(|f| f.has_live_worker()).count()
    }

    /// Start monitoring `path` right away.
    ///
    /// # Errors
    ///
    /// - [`DaqError::AlreadyMonitored`] if the file is already monitored
    /// - [`DaqError::SpawnFailed`] if the worker cannot be spawned; nothing is
    ///   registered in that case
    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> AppResult<()> {
        let path = path.into();
        if self.position(&path).is_some() {
            return Err(DaqError::AlreadyMonitored(path));
        }
        let (worker, slots) = self.spawn_worker(&path)?;
        let mut file = MonitoredFile::new(path.clone());
        file.attach(worker, slots);
        self.files.push(file);
        info!(path = %path.display(), "Monitoring file");

        if self.displayed.is_none() {
            self.displayed = Some(path);
        }
        Ok(())
    }

    /// Stop monitoring `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::NotMonitored`] if the file is not monitored.
    pub fn remove_file(&mut self, path: &Path) -> AppResult<()> {
        let idx = self
            .position(path)
            .ok_or_else(|| DaqError::NotMonitored(path.to_path_buf()))?;
        let mut file = self.files.remove(idx);
        file.shutdown();
        info!(path = %path.display(), "File no longer monitored");

        if self.displayed.as_deref() == Some(path) {
            self.displayed = self.files.first().map(|f| f.path.clone());
        }
        Ok(())
    }

    /// Select the file feeding the display. Ignored for unmonitored files.
    pub fn set_displayed(&mut self, path: &Path) {
        match self.position(path) {
            Some(idx) => {
                let file = &mut self.files[idx];
                file.pending_counts = None;
                file.pending_edges = None;
                self.displayed = Some(path.to_path_buf());
            }
            None => debug!(path = %path.display(), "Cannot display unmonitored file"),
        }
    }

    /// Stop every worker and forget all files. Workers start again when the next
    /// file set arrives.
    pub fn stop_all(&mut self) {
        info!(files = self.files.len(), "Stopping all file parsing");
        for mut file in self.files.drain(..).chain(self.detached.drain(..)) {
            file.shutdown();
        }
        self.displayed = None;
        self.restart_pending = true;
    }

    /// Replace the monitored set with `paths`, keeping their order and dropping
    /// duplicates. Workers for new files start on the next poll.
    pub fn replace_files(&mut self, paths: Vec<PathBuf>) {
        let mut seen = HashSet::new();
        let wanted: Vec<PathBuf> = paths.into_iter().filter(|p| seen.insert(p.clone())).collect();

        let mut previous: Vec<MonitoredFile> = self.files.drain(..).collect();
        for path in &wanted {
            let file = if let Some(idx) = previous.iter().position(|f| &f.path == path) {
                previous.swap_remove(idx)
            } else if let Some(idx) = self.detached.iter().position(|f| &f.path == path) {
                debug!(path = %path.display(), "Reattaching running parser");
                self.detached.swap_remove(idx)
            } else {
                MonitoredFile::new(path.clone())
            };
            self.files.push(file);
        }

        for mut dropped in previous {
            match self.settings.files_policy {
                FilesPolicy::Retain => {
                    debug!(path = %dropped.path.display(), "Detaching file from display");
                    self.detached.push(dropped);
                }
                FilesPolicy::Reconcile => {
                    info!(path = %dropped.path.display(), "Stopping parser for dropped file");
                    dropped.shutdown();
                }
            }
        }

        let keep_displayed = self
            .displayed
            .as_deref()
            .is_some_and(|d| self.position(d).is_some());
        if !keep_displayed {
            self.displayed = self.files.first().map(|f| f.path.clone());
        }
        self.restart_pending = true;
        info!(files = self.files.len(), "Monitored file set replaced");
    }

    /// Apply one control message.
    pub fn handle_command(&mut self, command: PlotterCommand) {
        match command {
            PlotterCommand::Files(paths) => self.replace_files(paths),
            PlotterCommand::Done => self.stop_all(),
            PlotterCommand::Invalid(verb) => warn!(%verb, "Ignoring unknown plotter command"),
        }
    }

    /// One display tick. Returns new snapshots of the displayed file, if any.
    pub fn poll(&mut self) -> Option<DisplayUpdate> {
        self.drain_control();
        for file in self.files.iter_mut().chain(self.detached.iter_mut()) {
            file.reap();
        }
        self.detached.retain(|f| f.worker.is_some());
        if self.files.is_empty() {
            return None;
        }

        if self.restart_pending {
            self.restart_pending = false;
            self.restart_workers();
            return None;
        }

        let displayed = self.displayed.clone()?;
        let idx = self.position(&displayed)?;
        let update = self.files[idx].drain();
        (!update.is_empty()).then_some(update)
    }

    /// Stop everything and wait for the workers, bounded by the hard timeout.
    pub async fn shutdown(&mut self) {
        let workers: Vec<WorkerHandle> = self
            .files
            .drain(..)
            .chain(self.detached.drain(..))
            .filter_map(|mut f| f.worker.take())
            .collect();
        futures::future::join_all(workers.into_iter().map(WorkerHandle::join)).await;
        self.displayed = None;
    }

    fn drain_control(&mut self) {
        let mut commands = Vec::new();
        if let Some(control) = self.control.as_mut() {
            while let Ok(command) = control.try_recv() {
                commands.push(command);
            }
        }
        for command in commands {
            self.handle_command(command);
        }
    }

    fn restart_workers(&mut self) {
        let mut failed = Vec::new();
        for idx in 0..self.files.len() {
            if self.files[idx].has_live_worker() {
                continue;
            }
            let path = self.files[idx].path.clone();
            match self.spawn_worker(&path) {
                Ok((worker, slots)) => {
                    info!(path = %path.display(), "Parser started");
                    self.files[idx].attach(worker, slots);
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to start parser, dropping file");
                    failed.push(path);
                }
            }
        }
        self.files.retain(|f| !failed.contains(&f.path));
        if self.displayed.as_ref().is_some_and(|d| failed.contains(d)) {
            self.displayed = self.files.first().map(|f| f.path.clone());
        }
    }

    fn spawn_worker(&self, path: &Path) -> AppResult<(WorkerHandle, SnapshotReceivers)> {
        let handle = Handle::try_current().map_err(|e| DaqError::SpawnFailed(e.to_string()))?;
        let (senders, receivers) = snapshot_channels();
        let cancel = CancellationToken::new();
        let worker = ParserWorker::new(
            path,
            self.settings.clone(),
            Arc::clone(&self.factory),
            senders,
            cancel.clone(),
        );
        let task = handle.spawn(worker.run());
        Ok((
            WorkerHandle {
                cancel,
                task,
                shutdown_timeout: self.settings.worker_shutdown_timeout(),
            },
            receivers,
        ))
    }

    fn position(&self, path: &Path) -> Option<usize> {
        self.files.iter().position(|f| f.path == path)
    }
}

/// Drive `supervisor` on the display tick until `cancel` fires, rendering every
/// update to `sink`.
pub async fn run_display_loop<S: PlotSink>(
    mut supervisor: LivePlotSupervisor,
    mut sink: S,
    cancel: CancellationToken,
) -> AppResult<()> {
    let adc_edges = adc_bin_edges(&supervisor.settings)?;
    let mut state = DisplayState::default();
    let mut ticker = interval(supervisor.settings.display_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(update) = supervisor.poll() {
                    state.apply(&update);
                    sink.render(&state, &adc_edges);
                }
            }
        }
    }

    info!("Display loop stopping");
    supervisor.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Sis3316DecoderFactory;

    fn supervisor(policy: FilesPolicy) -> LivePlotSupervisor {
        let settings = LivePlotSettings {
            files_policy: policy,
            ..LivePlotSettings::default()
        };
        LivePlotSupervisor::new(settings, Arc::new(Sis3316DecoderFactory::default()))
    }

    #[test]
    fn test_add_file_without_runtime_rolls_back() {
        let mut sup = supervisor(FilesPolicy::Retain);
        let err = sup.add_file("/tmp/ch00.dat").unwrap_err();
        assert!(matches!(err, DaqError::SpawnFailed(_)));
        assert!(sup.monitored().is_empty());
        assert_eq!(sup.displayed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("ch00.dat");
        let b = dir.path().join("ch01.dat");
        let mut sup = supervisor(FilesPolicy::Retain);

        sup.add_file(&a).unwrap();
        sup.add_file(&b).unwrap();
        assert!(matches!(sup.add_file(&a), Err(DaqError::AlreadyMonitored(_))));
        assert_eq!(sup.displayed(), Some(a.as_path()));
        assert_eq!(sup.live_workers(), 2);

        sup.remove_file(&a).unwrap();
        assert_eq!(sup.displayed(), Some(b.as_path()));
        assert!(matches!(sup.remove_file(&a), Err(DaqError::NotMonitored(_))));

        sup.set_displayed(&a);
        assert_eq!(sup.displayed(), Some(b.as_path()));
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_files_message_replaces_set_and_restarts() {
        let (tx, rx) = mpsc::channel(4);
        let mut sup = supervisor(FilesPolicy::Retain).with_control(rx);
        assert_eq!(sup.poll(), None);

        let paths = vec![
            PathBuf::from("/nonexistent/ch02.dat"),
            PathBuf::from("/nonexistent/ch00.dat"),
            PathBuf::from("/nonexistent/ch02.dat"),
        ];
        tx.send(PlotterCommand::Files(paths)).await.unwrap();

        assert_eq!(sup.poll(), None);
        assert_eq!(
            sup.monitored(),
            vec![PathBuf::from("/nonexistent/ch02.dat"), PathBuf::from("/nonexistent/ch00.dat")]
        );
        assert!(!sup.restart_pending());
        assert_eq!(sup.live_workers(), 2);
        assert_eq!(sup.displayed(), Some(Path::new("/nonexistent/ch02.dat")));

        tx.send(PlotterCommand::Done).await.unwrap();
        assert_eq!(sup.poll(), None);
        assert!(sup.monitored().is_empty());
        assert!(sup.restart_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_stops_dropped_workers() {
        let mut sup = supervisor(FilesPolicy::Reconcile);
        sup.replace_files(vec![PathBuf::from("/nonexistent/a"), PathBuf::from("/nonexistent/b")]);
        sup.poll();
        assert_eq!(sup.live_workers(), 2);

        sup.replace_files(vec![PathBuf::from("/nonexistent/b")]);
        assert!(sup.detached.is_empty());
        sup.poll();
        assert_eq!(sup.live_workers(), 1);
        assert_eq!(sup.displayed(), Some(Path::new("/nonexistent/b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retain_keeps_dropped_workers_until_stop() {
        let mut sup = supervisor(FilesPolicy::Retain);
        sup.replace_files(vec![PathBuf::from("/nonexistent/a"), PathBuf::from("/nonexistent/b")]);
        sup.poll();

        sup.replace_files(vec![PathBuf::from("/nonexistent/b")]);
        assert_eq!(sup.detached.len(), 1);
        assert!(sup.detached[0].has_live_worker());

        sup.stop_all();
        assert!(sup.detached.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggled_file_keeps_one_worker() {
        let a = PathBuf::from("/nonexistent/a");
        let b = PathBuf::from("/nonexistent/b");
        let mut sup = supervisor(FilesPolicy::Retain);

        for _ in 0..5 {
            sup.replace_files(vec![a.clone(), b.clone()]);
            sup.poll();
            sup.replace_files(vec![b.clone()]);
            sup.poll();
        }
        assert_eq!(sup.detached.len(), 1);
        assert!(sup.detached[0].has_live_worker());

        sup.replace_files(vec![a.clone(), b.clone()]);
        sup.poll();
        assert!(sup.detached.is_empty());
        assert_eq!(sup.live_workers(), 2);
        let workers_for_a = sup
            .files
            .iter()
            .filter(|f| f.path == a && f.has_live_worker())
            .count();
        assert_eq!(workers_for_a, 1);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_detached_workers_are_reaped() {
        let mut sup = supervisor(FilesPolicy::Retain);
        sup.replace_files(vec![PathBuf::from("/nonexistent/a")]);
        sup.poll();
        sup.replace_files(Vec::new());
        assert_eq!(sup.detached.len(), 1);

        sup.detached[0].worker.as_ref().unwrap().task.abort();
        for _ in 0..10 {
            if sup.detached[0].worker.as_ref().unwrap().is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(sup.detached[0].worker.as_ref().unwrap().is_finished());

        assert_eq!(sup.poll(), None);
        assert!(sup.detached.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_files_message_is_ignored() {
        let a = PathBuf::from("/nonexistent/a");
        let mut sup = supervisor(FilesPolicy::Retain);
        sup.replace_files(vec![a.clone()]);
        sup.poll();

        let frame = crate::messages::Frame::new("gui", "FILES", Vec::<String>::new());
        sup.handle_command(PlotterCommand::from_frame(&frame));
        assert_eq!(sup.monitored(), vec![a.clone()]);
        assert!(sup.detached.is_empty());
        assert_eq!(sup.live_workers(), 1);
        sup.shutdown().await;
    }

    #[test]
    fn test_display_state_retains_parts() {
        let mut state = DisplayState::default();
        let path = PathBuf::from("ch00.dat");
        state.apply(&DisplayUpdate {
            path: path.clone(),
            time: Some((vec![1, 2], vec![0, 1, 2])),
            adc_counts: Some(vec![5]),
        });
        state.apply(&DisplayUpdate {
            path: path.clone(),
            time: None,
            adc_counts: Some(vec![6]),
        });
        assert_eq!(state.time_counts, vec![1, 2]);
        assert_eq!(state.adc_counts, vec![6]);
        assert_eq!(state.total_events(), 3);

        state.apply(&DisplayUpdate {
            path: PathBuf::from("ch01.dat"),
            ..DisplayUpdate::default()
        });
        assert!(state.time_counts.is_empty());
    }

    #[test]
    fn test_adc_edges() {
        let settings = LivePlotSettings {
            adc_bins: 4,
            adc_max: 8.0,
            ..LivePlotSettings::default()
        };
        assert_eq!(adc_bin_edges(&settings).unwrap(), vec![0.0, 2.0, 4.0, 6.0, 8.0]);
    }
}
