//! Command-line controller for the readout server and the live plotter.

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use sis3316_daq::config::Settings;
use sis3316_daq::error::AppResult;
use sis3316_daq::messages::{Command, PlotterCommand, Reply};
use sis3316_daq::session::{next_run_folder, parse_channel_list, FileNaming};
use sis3316_daq::transport::FrameClient;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const CLIENT_ID: &str = "daqctl";

/// Control the SIS3316 readout server and live plotter
#[derive(Parser, Debug)]
#[command(name = "daqctl")]
#[command(about = "Send commands to the SIS3316 readout server and live plotter")]
struct Cli {
    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Readout server address
    #[arg(long)]
    server: Option<String>,

    /// Live plotter address
    #[arg(long)]
    plotter: Option<String>,

    /// Seconds to wait for a reply
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Check that the server is alive
    Ping,
    /// Load a device configuration file
    Config {
        /// JSON configuration path
        path: PathBuf,
    },
    /// Start acquisition into a folder
    Start {
        /// Output folder
        folder: PathBuf,
        /// Channel list, e.g. "[0, 1, 2]"
        channels: String,
    },
    /// Stop acquisition and the live plotter
    Stop {
        /// Leave the live plotter running
        #[arg(long)]
        keep_plotter: bool,
    },
    /// Shut the server down
    Shutdown,
    /// Replace the files followed by the live plotter
    Files {
        /// Data files to follow
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Stop all live plotter workers
    Done,
    /// Start a run in the next free dated folder and point the plotter at it
    Run {
        /// Parent folder of dated run folders
        base: PathBuf,
        /// Channel list, e.g. "[0, 1, 2]"
        channels: String,
        /// Device configuration to load before starting
        #[arg(long)]
        device_config: Option<PathBuf>,
    },
}

struct Controller {
    settings: Settings,
    timeout: Duration,
}

impl Controller {
    async fn server(&self) -> Result<FrameClient> {
        let addr = &self.settings.endpoints.command_addr;
        FrameClient::connect(addr.as_str(), CLIENT_ID)
            .await
            .with_context(|| format!("Cannot reach server at {addr}"))
    }

    async fn request(&self, command: Command) -> Result<Reply> {
        let mut client = self.server().await?;
        client.send(command.to_frame(CLIENT_ID)).await?;
        let reply = client
            .await_reply(self.timeout, |text| println!("status: {text}"))
            .await?;
        print_reply(&reply);
        Ok(reply)
    }

    async fn notify_plotter(&self, command: PlotterCommand) {
        let addr = &self.settings.endpoints.plot_addr;
        let result: AppResult<()> = async {
            let mut client = FrameClient::connect(addr.as_str(), CLIENT_ID).await?;
            client.send(command.to_frame(CLIENT_ID)).await
        }
        .await;
        match result {
            Ok(()) => println!("plotter: {}", plotter_verb(&command)),
            Err(e) => warn!(%addr, error = %e, "Live plotter not reachable"),
        }
    }

    fn channel_files(&self, folder: &Path, channels: &str) -> Result<Vec<PathBuf>> {
        let naming = FileNaming::from(&self.settings.output);
        let channels: BTreeSet<u8> = parse_channel_list(channels)?
            .into_iter()
            .map(|c| u8::try_from(c).with_context(|| format!("Channel {c} out of range")))
            .collect::<Result<_>>()?;
        Ok(channels
            .into_iter()
            .map(|c| folder.join(naming.file_name(c)))
            .collect())
    }

    async fn run(&self, base: &Path, channels: &str, device_config: Option<PathBuf>) -> Result<()> {
        if let Some(path) = device_config {
            ensure_ok(self.request(Command::Config { path }).await?)?;
        }
        let folder = next_run_folder(base, Local::now().date_naive());
        let files = self.channel_files(&folder, channels)?;
        println!("run folder: {}", folder.display());

        ensure_ok(
            self.request(Command::Start {
                folder: folder.display().to_string(),
                channels: channels.to_string(),
            })
            .await?,
        )?;
        self.notify_plotter(PlotterCommand::Files(files)).await;
        Ok(())
    }
}

fn plotter_verb(command: &PlotterCommand) -> &str {
    match command {
        PlotterCommand::Files(_) => "FILES",
        PlotterCommand::Done => "DONE",
        PlotterCommand::Invalid(verb) => verb,
    }
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Ok(text) => println!("ok: {text}"),
        Reply::Err { text, kind } => println!("error: {text} ({kind})"),
        Reply::Status(text) => println!("status: {text}"),
    }
}

fn ensure_ok(reply: Reply) -> Result<()> {
    match reply {
        Reply::Err { text, .. } => bail!("server refused: {text}"),
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(server) = &cli.server {
        settings.endpoints.command_addr.clone_from(server);
    }
    if let Some(plotter) = &cli.plotter {
        settings.endpoints.plot_addr.clone_from(plotter);
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let controller = Controller {
        settings,
        timeout: Duration::from_secs(cli.timeout),
    };

    match cli.command {
        Action::Ping => ensure_ok(controller.request(Command::Ping).await?),
        Action::Config { path } => ensure_ok(controller.request(Command::Config { path }).await?),
        Action::Start { folder, channels } => ensure_ok(
            controller
                .request(Command::Start {
                    folder: folder.display().to_string(),
                    channels,
                })
                .await?,
        ),
        Action::Stop { keep_plotter } => {
            let reply = controller.request(Command::Stop).await?;
            if !keep_plotter {
                controller.notify_plotter(PlotterCommand::Done).await;
            }
            ensure_ok(reply)
        }
        Action::Shutdown => ensure_ok(controller.request(Command::Shutdown).await?),
        Action::Files { paths } => {
            controller.notify_plotter(PlotterCommand::Files(paths)).await;
            Ok(())
        }
        Action::Done => {
            controller.notify_plotter(PlotterCommand::Done).await;
            Ok(())
        }
        Action::Run {
            base,
            channels,
            device_config,
        } => controller.run(&base, &channels, device_config).await,
    }
}
