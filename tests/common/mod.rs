//! Shared helpers for integration tests.

#![allow(dead_code)]

use sis3316_daq::config::Settings;
use sis3316_daq::error::AppResult;
use sis3316_daq::hardware::mock::MockDigitizer;
use sis3316_daq::messages::Reply;
use sis3316_daq::protocol::ControlEngine;
use sis3316_daq::readout::ReadoutSupervisor;
use sis3316_daq::transport::{serve, FrameClient};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reply timeout used by the tests.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal device configuration with peak heights on channels 0-3.
pub const DEVICE_CONFIG: &str = r#"{
    "channels": { "0": { "event_format_mask": 1 }, "1": { "event_format_mask": 1 } },
    "triggers": { "0": { "threshold": 134218128 } },
    "groups": { "0": { "gate_window": 200 } }
}"#;

/// Settings with short delays for tests.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.device.retry_delay_ms = 10;
    settings.readout.idle_poll_ms = 5;
    settings.readout.worker_shutdown_timeout_ms = 2000;
    settings.live_plot.display_tick_ms = 20;
    settings.live_plot.fill_window_ms = 50;
    settings.live_plot.file_poll_ms = 10;
    settings.live_plot.eof_backoff_ms = 10;
    settings.live_plot.adc_bins = 1024;
    settings
}

/// A readout server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub device: Arc<MockDigitizer>,
    pub engine: JoinHandle<AppResult<()>>,
    cancel: CancellationToken,
    transport: JoinHandle<AppResult<()>>,
}

impl TestServer {
    /// Connect to `device` and serve commands with `settings`.
    pub async fn spawn(device: MockDigitizer, settings: &Settings) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let (outbound_tx, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let transport = tokio::spawn(serve(listener, inbound_tx, outbound_tx.clone(), cancel.clone()));

        let device = Arc::new(device);
        let supervisor = ReadoutSupervisor::new(Arc::clone(&device), settings);
        let mut engine = ControlEngine::new(supervisor, outbound_tx);
        engine.connect().await.unwrap();
        let engine = tokio::spawn(engine.run(inbound_rx));

        TestServer {
            addr,
            device,
            engine,
            cancel,
            transport,
        }
    }

    /// Open a client connection.
    pub async fn client(&self) -> FrameClient {
        FrameClient::connect(self.addr, "test-gui").await.unwrap()
    }

    /// Stop the transport and wait for both tasks.
    pub async fn close(self) -> AppResult<()> {
        self.cancel.cancel();
        self.transport.await.unwrap()?;
        self.engine.await.unwrap()
    }
}

/// Send `frame` and return the next reply, collecting notifications.
pub async fn request(
    client: &mut FrameClient,
    frame: sis3316_daq::messages::Frame,
    statuses: &mut Vec<String>,
) -> Reply {
    client.send(frame).await.unwrap();
    client
        .await_reply(REPLY_TIMEOUT, |text| statuses.push(text.to_string()))
        .await
        .unwrap()
}

/// Write the test device configuration into `dir`.
pub fn write_device_config(dir: &Path) -> PathBuf {
    let path = dir.join("device.json");
    std::fs::write(&path, DEVICE_CONFIG).unwrap();
    path
}
