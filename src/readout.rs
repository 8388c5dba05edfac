//! Readout supervisor and worker.
//!
//! The supervisor owns the digitizer connection, the loaded device configuration
//! and at most one running acquisition. Starting an acquisition spawns the
//! readout worker, which streams every active channel into its output file until
//! cancelled.

use crate::config::{OutputSettings, ReadoutSettings, Settings};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{connect_with_retry, RetryPolicy};
use crate::hardware::{DeviceConfig, DeviceIdentity, Digitizer};
use crate::messages::NOT_STARTED;
use crate::session::{
    write_config_snapshot, AcquisitionSession, AttributeLog, ChannelFile, FileNaming, SessionConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Readout worker
// =============================================================================

/// Bytes written per channel by one acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadoutReport {
    /// `(channel, bytes)` in channel order
    pub bytes: Vec<(u8, u64)>,
}

impl ReadoutReport {
    /// Bytes written over all channels.
    pub fn total_bytes(&self) -> u64 {
        self.bytes.iter().map(|(_, n)| n).sum()
    }
}

/// Prepare the device and stream `files` until `cancel` fires.
///
/// The device is disarmed and the files are flushed on every exit path.
///
/// # Errors
///
/// Returns the first device or file error. The files keep whatever was written
/// before it.
pub async fn run_readout<D>(
    device: Arc<D>,
    files: Vec<ChannelFile>,
    settings: ReadoutSettings,
    cancel: CancellationToken,
) -> AppResult<ReadoutReport>
where
    D: Digitizer + ?Sized,
{
    if !device.configure().await? {
        warn!("Device status is false after configure");
    }
    device.disarm().await?;
    device.arm().await?;
    device.clear_timestamp().await?;
    // Swap banks so old data from a previous run is not read out
    device.flush_memory().await?;

    let mut outputs = Vec::with_capacity(files.len());
    for file in &files {
        let handle = File::create(&file.path)
            .await
            .map_err(|e| DaqError::resource(&file.path, e))?;
        outputs.push((file, handle, 0u64));
    }
    info!(channels = files.len(), "Readout running");

    let result = pump(device.as_ref(), &mut outputs, &settings, &cancel).await;

    if let Err(e) = device.disarm().await {
        warn!(error = %e, "Failed to disarm after readout");
    }
    for (file, handle, _) in &mut outputs {
        if let Err(e) = handle.flush().await {
            warn!(path = %file.path.display(), error = %e, "Failed to flush output file");
        }
    }

    result?;
    let report = ReadoutReport {
        bytes: outputs.iter().map(|(f, _, n)| (f.channel, *n)).collect(),
    };
    info!(bytes = report.total_bytes(), "Readout finished");
    Ok(report)
}

async fn pump<D>(
    device: &D,
    outputs: &mut [(&ChannelFile, File, u64)],
    settings: &ReadoutSettings,
    cancel: &CancellationToken,
) -> AppResult<()>
where
    D: Digitizer + ?Sized,
{
    let mut buf = Vec::with_capacity(settings.chunk_bytes);
    while !cancel.is_cancelled() {
        let mut idle = true;
        for (file, handle, written) in outputs.iter_mut() {
            buf.clear();
            let n = device
                .read_stream(file.channel, &mut buf, settings.chunk_bytes)
                .await?;
            if n == 0 {
                continue;
            }
            handle
                .write_all(&buf)
                .await
                .map_err(|e| DaqError::resource(&file.path, e))?;
            *written += n as u64;
            idle = false;
        }
        if idle {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(settings.idle_poll()) => {}
            }
        }
    }
    Ok(())
}

// =============================================================================
// Readout supervisor
// =============================================================================

/// Outcome of a worker task as observed by the supervisor.
pub type WorkerExit = Result<AppResult<ReadoutReport>, JoinError>;

/// What remains of an acquisition once it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct StopSummary {
    /// Output folder of the acquisition
    pub folder: PathBuf,
    /// Worker report, `None` if the worker failed or was aborted
    pub report: Option<ReadoutReport>,
    /// Device identity read after stopping
    pub identity: Option<DeviceIdentity>,
}

#[derive(Debug)]
struct ActiveRun {
    session: AcquisitionSession,
    cancel: CancellationToken,
    task: JoinHandle<AppResult<ReadoutReport>>,
}

/// Owns the device connection and the running acquisition.
#[derive(Debug)]
pub struct ReadoutSupervisor<D: ?Sized> {
    device: Arc<D>,
    retry: RetryPolicy,
    output: OutputSettings,
    readout: ReadoutSettings,
    naming: FileNaming,
    config: Option<DeviceConfig>,
    identity: Option<DeviceIdentity>,
    active: Option<ActiveRun>,
}

impl<D> ReadoutSupervisor<D>
where
    D: Digitizer + ?Sized + 'static,
{
    /// Create a supervisor for `device`. Nothing is connected yet.
    pub fn new(device: Arc<D>, settings: &Settings) -> Self {
        Self {
            device,
            retry: RetryPolicy::from_settings(&settings.device),
            output: settings.output.clone(),
            readout: settings.readout.clone(),
            naming: FileNaming::from(&settings.output),
            config: None,
            identity: None,
            active: None,
        }
    }

    /// The device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Configuration applied by the last successful `load_config`.
    pub fn config(&self) -> Option<&DeviceConfig> {
        self.config.as_ref()
    }

    /// Identity read at the last connect or stop.
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Whether an acquisition is running.
    pub fn is_acquiring(&self) -> bool {
        self.active.is_some()
    }

    /// Output folder of the running acquisition.
    pub fn active_folder(&self) -> Option<&Path> {
        self.active.as_ref().map(|run| run.session.config().folder())
    }

    /// Connect with retries and read the device identity.
    ///
    /// `on_offline` is called after every failed attempt.
    pub async fn connect<F>(&mut self, on_offline: F) -> AppResult<DeviceIdentity>
    where
        F: FnMut(u32, &DaqError),
    {
        info!("Connecting to sis3316...");
        connect_with_retry(self.device.as_ref(), &self.retry, on_offline).await?;
        let identity = self.device.identity().await?;
        info!(
            module_id = %identity.module_id,
            serial = identity.serial,
            temperature_c = identity.temperature_c,
            "Connected"
        );
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Load a JSON configuration file and apply it to the device.
    pub async fn load_config(&mut self, path: &Path) -> AppResult<()> {
        info!(path = %path.display(), "Loading config file");
        let config = DeviceConfig::load(path)?;
        self.device.apply_config(&config).await?;
        self.config = Some(config);
        Ok(())
    }

    /// Validate a `START` request and prepare its output folder.
    pub fn prepare_session(&self, folder: &str, channels: &str) -> AppResult<SessionConfig> {
        SessionConfig::prepare(folder, channels, &self.naming)
    }

    /// Spawn the readout worker for `session`.
    pub fn start(&mut self, session: SessionConfig) -> AppResult<()> {
        if self.is_acquiring() {
            return Err(DaqError::Protocol("acquisition already running".into()));
        }
        let session = AcquisitionSession::begin(session);
        let attr = AttributeLog::new(session.config().folder(), &self.output.attr_file);
        if let Err(e) = attr.record_start(session.started_at()) {
            warn!(error = %e, "Failed to record start time");
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_readout(
            Arc::clone(&self.device),
            session.config().files().to_vec(),
            self.readout.clone(),
            cancel.clone(),
        ));
        info!(
            folder = %session.config().folder().display(),
            channels = ?session.config().channels(),
            "Acquisition started"
        );
        self.active = Some(ActiveRun {
            session,
            cancel,
            task,
        });
        Ok(())
    }

    /// Stop the running acquisition.
    ///
    /// The worker is cancelled and given the shutdown timeout to finish before it
    /// is aborted. The stop time and configuration snapshot are written to the
    /// output folder.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Protocol`] if nothing is running.
    pub async fn stop(&mut self) -> AppResult<StopSummary> {
        let run = self
            .active
            .take()
            .ok_or_else(|| DaqError::Protocol(NOT_STARTED.into()))?;
        run.cancel.cancel();

        let limit = self.readout.worker_shutdown_timeout();
        let abort = run.task.abort_handle();
        let report = match timeout(limit, run.task).await {
            Ok(Ok(Ok(report))) => Some(report),
            Ok(Ok(Err(e))) => {
                error!(error = %e, "Readout worker failed");
                None
            }
            Ok(Err(join_err)) => {
                error!(error = %join_err, "Readout worker panicked");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = limit.as_millis() as u64,
                    "Readout worker did not stop in time, aborting"
                );
                abort.abort();
                None
            }
        };
        Ok(self.close_session(run.session, report).await)
    }

    /// Resolves when the running worker exits by itself. Pending while idle.
    ///
    /// Follow up with [`finish_exited`](Self::finish_exited).
    pub async fn worker_exit(&mut self) -> WorkerExit {
        match self.active.as_mut() {
            Some(run) => (&mut run.task).await,
            None => std::future::pending().await,
        }
    }

    /// Close the session of a worker that exited by itself.
    pub async fn finish_exited(&mut self, exit: WorkerExit) -> Option<StopSummary> {
        let run = self.active.take()?;
        let report = match exit {
            Ok(Ok(report)) => {
                warn!("Readout worker exited without being stopped");
                Some(report)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Readout worker failed");
                None
            }
            Err(join_err) => {
                error!(error = %join_err, "Readout worker panicked");
                None
            }
        };
        Some(self.close_session(run.session, report).await)
    }

    /// Stop any acquisition and close the device.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        if self.is_acquiring() {
            self.stop().await?;
        }
        self.device.close().await?;
        info!("Device closed");
        Ok(())
    }

    async fn close_session(
        &mut self,
        mut session: AcquisitionSession,
        report: Option<ReadoutReport>,
    ) -> StopSummary {
        let stopped_at = session.finish();
        let folder = session.config().folder().to_path_buf();

        let attr = AttributeLog::new(&folder, &self.output.attr_file);
        if let Err(e) = attr.record_end(stopped_at) {
            warn!(error = %e, "Failed to record stop time");
        }
        if let Some(config) = &self.config {
            match write_config_snapshot(&folder, &self.output.config_snapshot, config) {
                Ok(path) => debug!(path = %path.display(), "Configuration snapshot written"),
                Err(e) => warn!(error = %e, "Failed to write configuration snapshot"),
            }
        }

        let identity = match self.device.identity().await {
            Ok(identity) => {
                info!(%identity, "Data collection stopped");
                self.identity = Some(identity.clone());
                Some(identity)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read device identity after stop");
                None
            }
        };
        StopSummary {
            folder,
            report,
            identity,
        }
    }
}
