//! Readout server for the SIS3316 digitizer.
//!
//! Connects to the device, then serves `CONFIG`, `START`, `STOP`, `PING` and
//! `SHUTDOWN` commands on the command endpoint until shut down.

use anyhow::{Context, Result};
use clap::Parser;
use sis3316_daq::config::Settings;
use sis3316_daq::hardware::mock::MockDigitizer;
use sis3316_daq::logging::init_tracing;
use sis3316_daq::messages::{Command, SERVER_ID};
use sis3316_daq::protocol::ControlEngine;
use sis3316_daq::readout::ReadoutSupervisor;
use sis3316_daq::transport::serve;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// SIS3316 config loading and data readout server
#[derive(Parser, Debug)]
#[command(name = "readout_server")]
#[command(about = "Serve SIS3316 configuration and readout commands")]
struct Args {
    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Digitizer IP address
    #[arg(long)]
    host: Option<String>,

    /// Digitizer UDP port
    #[arg(long)]
    port: Option<u16>,

    /// Connection attempt gate before giving up
    #[arg(long)]
    max_retries: Option<u32>,

    /// Command endpoint address
    #[arg(long)]
    listen: Option<String>,
}

impl Args {
    fn settings(&self) -> Result<Settings> {
        let mut settings =
            Settings::load(self.config.as_deref()).context("Failed to load settings")?;
        if let Some(host) = &self.host {
            settings.device.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.device.port = port;
        }
        if let Some(max_retries) = self.max_retries {
            settings.device.max_retries = max_retries;
        }
        if let Some(listen) = &self.listen {
            settings.endpoints.command_addr.clone_from(listen);
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = args.settings()?;
    init_tracing(&settings.application)?;

    info!(server = SERVER_ID, "Starting server");
    let listener = TcpListener::bind(&settings.endpoints.command_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.endpoints.command_addr))?;

    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let (outbound_tx, _) = broadcast::channel(64);
    let cancel = CancellationToken::new();
    let transport = tokio::spawn(serve(
        listener,
        inbound_tx.clone(),
        outbound_tx.clone(),
        cancel.clone(),
    ));

    // Ctrl-C goes through the same path as a SHUTDOWN command
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            let _ = inbound_tx.send(Command::Shutdown.to_frame("signal")).await;
        }
    });

    let device = Arc::new(MockDigitizer::with_address(
        settings.device.host.clone(),
        settings.device.port,
    ));
    let supervisor = ReadoutSupervisor::new(device, &settings);
    let mut engine = ControlEngine::new(supervisor, outbound_tx);

    let result = match engine.connect().await {
        Ok(()) => engine.run(inbound_rx).await.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow::Error::from(e).context("sis3316 unreachable")),
    };

    cancel.cancel();
    match transport.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Transport ended with error"),
        Err(e) => error!(error = %e, "Transport task failed"),
    }
    result
}
