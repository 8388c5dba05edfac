//! Live histogram display for SIS3316 output files.
//!
//! Follows the files named on the command line or in `FILES` messages and logs a
//! histogram summary of the displayed file on every display tick.

use anyhow::{Context, Result};
use clap::Parser;
use sis3316_daq::config::Settings;
use sis3316_daq::decoder::Sis3316DecoderFactory;
use sis3316_daq::live_plot::{run_display_loop, LivePlotSupervisor, LogSink};
use sis3316_daq::logging::init_tracing;
use sis3316_daq::messages::{Frame, PlotterCommand, PLOTTER_ID};
use sis3316_daq::transport::serve;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Live plotter for SIS3316 data files
#[derive(Parser, Debug)]
#[command(name = "live_plot")]
#[command(about = "Live ADC and event-rate histograms of SIS3316 output files")]
struct Args {
    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Files to monitor from the start
    #[arg(short, long = "infiles", num_args = 1..)]
    infiles: Vec<PathBuf>,

    /// ADC histogram bin count
    #[arg(long)]
    nbins: Option<usize>,

    /// Plot control endpoint address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    if let Some(nbins) = args.nbins {
        settings.live_plot.adc_bins = nbins;
    }
    if let Some(listen) = &args.listen {
        settings.endpoints.plot_addr.clone_from(listen);
    }
    settings.validate()?;
    init_tracing(&settings.application)?;

    info!(plotter = PLOTTER_ID, "Starting live plotter");
    let listener = TcpListener::bind(&settings.endpoints.plot_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.endpoints.plot_addr))?;

    let cancel = CancellationToken::new();
    let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(32);
    let (outbound_tx, _) = broadcast::channel(8);
    let transport = tokio::spawn(serve(listener, frames_tx, outbound_tx, cancel.clone()));

    let (control_tx, control_rx) = mpsc::channel(32);
    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let command = PlotterCommand::from_frame(&frame);
            info!(from = %frame.identity, ?command, "Received");
            if control_tx.send(command).await.is_err() {
                break;
            }
        }
    });

    let factory = Arc::new(Sis3316DecoderFactory::new(settings.live_plot.maw_test_words));
    let mut supervisor =
        LivePlotSupervisor::new(settings.live_plot.clone(), factory).with_control(control_rx);
    for path in args.infiles {
        if let Err(e) = supervisor.add_file(&path) {
            warn!(path = %path.display(), error = %e, "Cannot monitor file");
        }
    }

    let display = tokio::spawn(run_display_loop(supervisor, LogSink, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    info!("Received interrupt, shutting down");
    cancel.cancel();

    display.await??;
    transport.await??;
    Ok(())
}
