//! Control protocol engine of the readout server.
//!
//! Commands are handled strictly one at a time. What a command does depends only
//! on the protocol state, which is decided by [`plan`]. The engine executes the
//! plan against the [`ReadoutSupervisor`] and moves to the next state.
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> READY <-> ACQUIRING
//!                                  \         /
//!                                   SHUT_DOWN
//! ```

use crate::error::{AppResult, DaqError, ErrorKind};
use crate::hardware::Digitizer;
use crate::messages::{
    Command, Frame, Reply, CONFIG_LOADED, FILE_EXISTS, INVALID_COMMAND, INVALID_START_FORMAT,
    NOT_STARTED, OFFLINE, ONLINE, PONG, READOUT_EXITED, SEND_STOP_FIRST, SERVER_CLOSED, SERVER_ID,
    STARTED, STOPPED,
};
use crate::readout::{ReadoutSupervisor, StopSummary, WorkerExit};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Protocol state of the readout server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Not connected to the device
    Disconnected,
    /// Connection attempts in progress
    Connecting,
    /// Connected and idle
    Ready,
    /// Readout worker running
    Acquiring,
    /// Device closed, no further commands
    ShutDown,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Disconnected => "DISCONNECTED",
            ProtocolState::Connecting => "CONNECTING",
            ProtocolState::Ready => "READY",
            ProtocolState::Acquiring => "ACQUIRING",
            ProtocolState::ShutDown => "SHUT_DOWN",
        };
        f.write_str(name)
    }
}

/// What to do with a command in a given state.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Answer right away, state unchanged
    Reply(Reply),
    /// Load and apply a configuration file
    LoadConfig(PathBuf),
    /// Validate and start an acquisition
    Start {
        /// Output folder
        folder: String,
        /// Channel list literal
        channels: String,
    },
    /// Stop the acquisition
    Stop,
    /// Stop everything, close the device and exit
    Shutdown,
}

fn protocol_violation(text: &str) -> Plan {
    Plan::Reply(Reply::err(text, ErrorKind::ProtocolViolation))
}

/// Transition table of the command channel.
pub fn plan(state: ProtocolState, command: &Command) -> Plan {
    use ProtocolState::*;

    match (state, command) {
        (ShutDown, _) => protocol_violation(SERVER_CLOSED),
        (_, Command::Shutdown) => Plan::Shutdown,
        (Disconnected | Connecting, _) => protocol_violation(OFFLINE),
        (_, Command::Ping) => Plan::Reply(Reply::ok(PONG)),

        (Acquiring, Command::Stop) => Plan::Stop,
        (Acquiring, _) => protocol_violation(SEND_STOP_FIRST),

        (Ready, Command::Config { path }) => Plan::LoadConfig(path.clone()),
        (Ready, Command::Start { folder, channels }) => Plan::Start {
            folder: folder.clone(),
            channels: channels.clone(),
        },
        (Ready, Command::Stop) => protocol_violation(NOT_STARTED),
        (Ready, Command::Invalid { verb }) => Plan::Reply(Reply::err(
            INVALID_COMMAND,
            ErrorKind::ValidationFailed {
                reason: format!("unknown verb or wrong argument count: {verb}"),
            },
        )),
    }
}

/// Executes commands against the readout supervisor.
pub struct ControlEngine<D: ?Sized> {
    state: ProtocolState,
    supervisor: ReadoutSupervisor<D>,
    outbound: broadcast::Sender<Frame>,
    notices: Vec<Reply>,
}

impl<D> ControlEngine<D>
where
    D: Digitizer + ?Sized + 'static,
{
    /// Create an engine in the `DISCONNECTED` state. Replies and notifications are
    /// published on `outbound`.
    pub fn new(supervisor: ReadoutSupervisor<D>, outbound: broadcast::Sender<Frame>) -> Self {
        Self {
            state: ProtocolState::Disconnected,
            supervisor,
            outbound,
            notices: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// The readout supervisor.
    pub fn supervisor(&self) -> &ReadoutSupervisor<D> {
        &self.supervisor
    }

    /// Connect to the device, announcing every failed attempt.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::ConnectionFailed`] once the retries are exhausted; the
    /// engine is back in `DISCONNECTED` and the caller should exit.
    pub async fn connect(&mut self) -> AppResult<()> {
        self.state = ProtocolState::Connecting;
        let outbound = &self.outbound;
        let result = self
            .supervisor
            .connect(|attempt, e| {
                warn!(attempt, error = %e, "Response timeout, check that the sis3316 is turned on");
                publish(outbound, &Reply::status(OFFLINE));
            })
            .await;

        match result {
            Ok(identity) => {
                self.send(&Reply::status(identity.to_string()));
                self.send(&Reply::status(ONLINE));
                self.state = ProtocolState::Ready;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Max retries reached");
                self.state = ProtocolState::Disconnected;
                Err(e)
            }
        }
    }

    /// Handle one command and return its reply. Notifications caused by the
    /// command are queued, see [`take_notices`](Self::take_notices).
    pub async fn handle(&mut self, command: Command) -> Reply {
        let before = self.state;
        let reply = match plan(self.state, &command) {
            Plan::Reply(reply) => reply,
            Plan::LoadConfig(path) => match self.supervisor.load_config(&path).await {
                Ok(()) => Reply::ok(CONFIG_LOADED),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load config");
                    Reply::from_error(e.to_string(), &e)
                }
            },
            Plan::Start { folder, channels } => self.start(&folder, &channels),
            Plan::Stop => match self.supervisor.stop().await {
                Ok(summary) => {
                    self.state = ProtocolState::Ready;
                    self.announce_stop(&summary);
                    Reply::ok(STOPPED)
                }
                Err(e) => Reply::from_error(e.to_string(), &e),
            },
            Plan::Shutdown => {
                if let Err(e) = self.supervisor.shutdown().await {
                    warn!(error = %e, "Error while closing the device");
                }
                self.state = ProtocolState::ShutDown;
                Reply::ok(SERVER_CLOSED)
            }
        };

        if before != self.state {
            info!(from = %before, to = %self.state, command = command.name(), "State changed");
        }
        reply
    }

    /// Notifications queued by the last commands.
    pub fn take_notices(&mut self) -> Vec<Reply> {
        std::mem::take(&mut self.notices)
    }

    /// Close the session of a readout worker that exited by itself.
    pub async fn on_worker_exit(&mut self, exit: WorkerExit) {
        if let Some(summary) = self.supervisor.finish_exited(exit).await {
            self.state = ProtocolState::Ready;
            self.notices.push(Reply::status(READOUT_EXITED));
            self.announce_stop(&summary);
        }
    }

    /// Serve commands from `inbox` until `SHUTDOWN` or until the inbox closes.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Frame>) -> AppResult<()> {
        enum Event {
            Frame(Option<Frame>),
            WorkerExit(WorkerExit),
        }

        info!("Waiting for commands");
        while self.state != ProtocolState::ShutDown {
            let event = tokio::select! {
                frame = inbox.recv() => Event::Frame(frame),
                exit = self.supervisor.worker_exit() => Event::WorkerExit(exit),
            };

            match event {
                Event::Frame(Some(frame)) => {
                    let command = Command::from_frame(&frame);
                    info!(from = %frame.identity, command = command.name(), "Received");
                    let reply = self.handle(command).await;
                    self.send(&reply);
                }
                Event::Frame(None) => {
                    info!("Command channel closed");
                    self.supervisor.shutdown().await?;
                    self.state = ProtocolState::ShutDown;
                }
                Event::WorkerExit(exit) => self.on_worker_exit(exit).await,
            }
            for notice in self.take_notices() {
                self.send(&notice);
            }
        }
        info!("Closing server");
        Ok(())
    }

    fn start(&mut self, folder: &str, channels: &str) -> Reply {
        let session = match self.supervisor.prepare_session(folder, channels) {
            Ok(session) => session,
            Err(e @ (DaqError::InvalidChannelList(_) | DaqError::ChannelOutOfRange(_))) => {
                warn!(error = %e, "Rejected START");
                return Reply::from_error(INVALID_START_FORMAT, &e);
            }
            Err(e) => {
                warn!(error = %e, "Rejected START");
                return Reply::from_error(FILE_EXISTS, &e);
            }
        };
        match self.supervisor.start(session) {
            Ok(()) => {
                self.state = ProtocolState::Acquiring;
                Reply::ok(STARTED)
            }
            Err(e) => Reply::from_error(e.to_string(), &e),
        }
    }

    fn announce_stop(&mut self, summary: &StopSummary) {
        if let Some(report) = &summary.report {
            info!(
                folder = %summary.folder.display(),
                bytes = report.total_bytes(),
                "Data collection stopped"
            );
        }
        if let Some(identity) = &summary.identity {
            self.notices.push(Reply::status(identity.to_string()));
        }
    }

    fn send(&self, reply: &Reply) {
        publish(&self.outbound, reply);
    }
}

/// Publish to all connected clients. Having none is not an error.
fn publish(outbound: &broadcast::Sender<Frame>, reply: &Reply) {
    if outbound.send(reply.to_frame(SERVER_ID)).is_err() {
        tracing::debug!(%reply, "No client connected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(channels: &str) -> Command {
        Command::Start {
            folder: "/tmp/run".into(),
            channels: channels.into(),
        }
    }

    #[test]
    fn test_ping_in_live_states() {
        for state in [ProtocolState::Ready, ProtocolState::Acquiring] {
            assert_eq!(plan(state, &Command::Ping), Plan::Reply(Reply::ok(PONG)));
        }
    }

    #[test]
    fn test_acquiring_rejects_everything_but_stop() {
        let rejected = [
            Command::Config {
                path: "conf.json".into(),
            },
            start("[0, 1]"),
            Command::Invalid { verb: "X".into() },
        ];
        for command in rejected {
            let plan = plan(ProtocolState::Acquiring, &command);
            assert_eq!(plan, protocol_violation(SEND_STOP_FIRST), "{command:?}");
        }
        assert_eq!(plan(ProtocolState::Acquiring, &Command::Stop), Plan::Stop);
        assert_eq!(plan(ProtocolState::Acquiring, &Command::Shutdown), Plan::Shutdown);
    }

    #[test]
    fn test_ready_transitions() {
        assert_eq!(
            plan(ProtocolState::Ready, &start("[0, 1]")),
            Plan::Start {
                folder: "/tmp/run".into(),
                channels: "[0, 1]".into()
            }
        );
        assert_eq!(
            plan(ProtocolState::Ready, &Command::Stop),
            protocol_violation(NOT_STARTED)
        );
        match plan(ProtocolState::Ready, &Command::Invalid { verb: "FOO".into() }) {
            Plan::Reply(reply) => {
                assert_eq!(reply.text(), INVALID_COMMAND);
                assert!(matches!(reply.kind(), Some(ErrorKind::ValidationFailed { .. })));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_offline_and_closed_states() {
        assert_eq!(
            plan(ProtocolState::Disconnected, &Command::Ping),
            protocol_violation(OFFLINE)
        );
        assert_eq!(plan(ProtocolState::Connecting, &Command::Shutdown), Plan::Shutdown);
        assert_eq!(
            plan(ProtocolState::ShutDown, &Command::Ping),
            protocol_violation(SERVER_CLOSED)
        );
    }
}
