//! Message types for the command and plot control channels
//!
//! Every message is a multipart [`Frame`]: the sender identity, a verb and zero or
//! more arguments. This module turns frames into typed commands and builds the
//! response and notification frames sent back.
//!
//! Responses use three verbs:
//!
//! - `OK [text]` for an accepted command
//! - `ERR [text, kind, detail]` for a rejected one, `kind` being an
//!   [`ErrorKind`] tag so clients do not have to parse the text
//! - `STATUS [text]` for unsolicited notifications

use crate::error::{DaqError, ErrorKind};
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;

/// Identity of the readout server endpoint.
pub const SERVER_ID: &str = "sis3316";

/// Identity of the live plotter endpoint.
pub const PLOTTER_ID: &str = "livePlotter";

// Fixed response texts
/// Reply to `PING`.
pub const PONG: &str = "PONG";
/// Reply to a successful `CONFIG`.
pub const CONFIG_LOADED: &str = "Config loaded";
/// Reply to a successful `START`.
pub const STARTED: &str = "sis3316 started";
/// Reply to a `START` whose arguments do not parse or name invalid channels.
pub const INVALID_START_FORMAT: &str = "Invalid command START format";
/// Reply to a `START` that would overwrite data or cannot create its folder.
pub const FILE_EXISTS: &str = "File exists error";
/// Reply to a successful `STOP`.
pub const STOPPED: &str = "sis3316 stopped";
/// Reply to `STOP` while idle.
pub const NOT_STARTED: &str = "Cannot stop sis3316 when it hasn't started yet";
/// Reply to anything but `STOP` while acquiring.
pub const SEND_STOP_FIRST: &str = "Invalid command: send STOP first";
/// Reply to `SHUTDOWN`.
pub const SERVER_CLOSED: &str = "sis3316 server closed";
/// Reply to an unknown verb or wrong arity.
pub const INVALID_COMMAND: &str = "Invalid command";
/// Notification after a failed connection attempt.
pub const OFFLINE: &str = "sis3316 is offline";
/// Notification once the device is connected.
pub const ONLINE: &str = "sis3316 is online";
/// Notification when the readout worker exits without a `STOP`.
pub const READOUT_EXITED: &str = "sis3316 readout stopped unexpectedly";

/// One multipart message: `[identity, verb, args...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Endpoint identity of the sender
    pub identity: String,
    /// Message verb
    pub verb: Bytes,
    /// Remaining parts
    pub args: Vec<Bytes>,
}

impl Frame {
    /// Build a frame from text parts.
    pub fn new<I, S>(identity: impl Into<String>, verb: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity: identity.into(),
            verb: Bytes::copy_from_slice(verb.as_bytes()),
            args: args.into_iter().map(|a| Bytes::from(a.into())).collect(),
        }
    }

    /// Verb as text, with invalid UTF-8 replaced.
    pub fn verb_str(&self) -> String {
        String::from_utf8_lossy(&self.verb).into_owned()
    }

    /// Argument `index` as text, with invalid UTF-8 replaced.
    pub fn arg_str(&self, index: usize) -> Option<String> {
        self.args
            .get(index)
            .map(|a| String::from_utf8_lossy(a).into_owned())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.identity, self.verb_str())?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

// =============================================================================
// Readout server commands
// =============================================================================

/// Command received on the readout server channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Load a JSON device configuration
    Config {
        /// Configuration file path
        path: PathBuf,
    },
    /// Start acquisition
    Start {
        /// Output folder
        folder: String,
        /// Channel list literal, parsed when the command is executed
        channels: String,
    },
    /// Stop acquisition
    Stop,
    /// Liveness check
    Ping,
    /// Close the device and exit
    Shutdown,
    /// Unknown verb or wrong argument count
    Invalid {
        /// The verb as received
        verb: String,
    },
}

impl Command {
    /// Classify a frame. `CONFIG` needs exactly one argument and `START` exactly
    /// two; extra arguments of the other verbs are ignored.
    pub fn from_frame(frame: &Frame) -> Self {
        let verb = frame.verb_str();
        match (verb.as_str(), frame.args.len()) {
            ("CONFIG", 1) => Command::Config {
                path: PathBuf::from(frame.arg_str(0).unwrap_or_default()),
            },
            ("START", 2) => Command::Start {
                folder: frame.arg_str(0).unwrap_or_default(),
                channels: frame.arg_str(1).unwrap_or_default(),
            },
            ("STOP", _) => Command::Stop,
            ("PING", _) => Command::Ping,
            ("SHUTDOWN", _) => Command::Shutdown,
            _ => Command::Invalid { verb },
        }
    }

    /// Encode as a frame sent by `identity`.
    pub fn to_frame(&self, identity: &str) -> Frame {
        match self {
            Command::Config { path } => {
                Frame::new(identity, "CONFIG", [path.display().to_string()])
            }
            Command::Start { folder, channels } => {
                Frame::new(identity, "START", [folder.clone(), channels.clone()])
            }
            Command::Stop => Frame::new(identity, "STOP", Vec::<String>::new()),
            Command::Ping => Frame::new(identity, "PING", Vec::<String>::new()),
            Command::Shutdown => Frame::new(identity, "SHUTDOWN", Vec::<String>::new()),
            Command::Invalid { verb } => Frame::new(identity, verb, Vec::<String>::new()),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Config { .. } => "CONFIG",
            Command::Start { .. } => "START",
            Command::Stop => "STOP",
            Command::Ping => "PING",
            Command::Shutdown => "SHUTDOWN",
            Command::Invalid { .. } => "INVALID",
        }
    }
}

// =============================================================================
// Live plotter commands
// =============================================================================

/// Command received on the live plotter channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlotterCommand {
    /// Replace the set of monitored files
    Files(Vec<PathBuf>),
    /// Stop monitoring everything
    Done,
    /// Anything else, including `FILES` without names
    Invalid(String),
}

impl PlotterCommand {
    /// Classify a frame.
    pub fn from_frame(frame: &Frame) -> Self {
        let verb = frame.verb_str();
        match verb.as_str() {
            "FILES" if !frame.args.is_empty() => PlotterCommand::Files(
                frame
                    .args
                    .iter()
                    .map(|a| PathBuf::from(String::from_utf8_lossy(a).into_owned()))
                    .collect(),
            ),
            "DONE" => PlotterCommand::Done,
            _ => PlotterCommand::Invalid(verb),
        }
    }

    /// Encode as a frame sent by `identity`.
    pub fn to_frame(&self, identity: &str) -> Frame {
        match self {
            PlotterCommand::Files(paths) => Frame::new(
                identity,
                "FILES",
                paths.iter().map(|p| p.display().to_string()),
            ),
            PlotterCommand::Done => Frame::new(identity, "DONE", Vec::<String>::new()),
            PlotterCommand::Invalid(verb) => Frame::new(identity, verb, Vec::<String>::new()),
        }
    }
}

// =============================================================================
// Responses and notifications
// =============================================================================

/// Response or notification sent by an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Command accepted
    Ok(String),
    /// Command rejected
    Err {
        /// Human-readable text
        text: String,
        /// Machine-readable classification
        kind: ErrorKind,
    },
    /// Unsolicited notification
    Status(String),
}

impl Reply {
    /// Accepted with `text`.
    pub fn ok(text: impl Into<String>) -> Self {
        Reply::Ok(text.into())
    }

    /// Rejected with `text` and a kind.
    pub fn err(text: impl Into<String>, kind: ErrorKind) -> Self {
        Reply::Err {
            text: text.into(),
            kind,
        }
    }

    /// Rejected with `text`, classified from `error`.
    pub fn from_error(text: impl Into<String>, error: &DaqError) -> Self {
        Self::err(text, error.kind())
    }

    /// Notification with `text`.
    pub fn status(text: impl Into<String>) -> Self {
        Reply::Status(text.into())
    }

    /// The human-readable text.
    pub fn text(&self) -> &str {
        match self {
            Reply::Ok(text) | Reply::Status(text) | Reply::Err { text, .. } => text,
        }
    }

    /// Error kind of a rejection.
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            Reply::Err { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Encode as a frame sent by `identity`.
    pub fn to_frame(&self, identity: &str) -> Frame {
        match self {
            Reply::Ok(text) => Frame::new(identity, "OK", [text.clone()]),
            Reply::Status(text) => Frame::new(identity, "STATUS", [text.clone()]),
            Reply::Err { text, kind } => Frame::new(
                identity,
                "ERR",
                [text.clone(), kind.tag().to_string(), kind.detail().to_string()],
            ),
        }
    }

    /// Decode a response frame. Returns `None` for unknown verbs.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let text = frame.arg_str(0).unwrap_or_default();
        match frame.verb_str().as_str() {
            "OK" => Some(Reply::Ok(text)),
            "STATUS" => Some(Reply::Status(text)),
            "ERR" => {
                let tag = frame.arg_str(1)?;
                let detail = frame.arg_str(2).unwrap_or_default();
                let kind = ErrorKind::from_tag(&tag, &detail)?;
                Some(Reply::Err { text, kind })
            }
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(text) => write!(f, "{text}"),
            Reply::Status(text) => write!(f, "[status] {text}"),
            Reply::Err { text, kind } => write!(f, "{text} ({kind})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_arity() {
        let frame = Frame::new("gui", "CONFIG", ["conf.json"]);
        assert_eq!(
            Command::from_frame(&frame),
            Command::Config {
                path: PathBuf::from("conf.json")
            }
        );

        let frame = Frame::new("gui", "CONFIG", Vec::<String>::new());
        assert!(matches!(Command::from_frame(&frame), Command::Invalid { .. }));

        let frame = Frame::new("gui", "START", ["/tmp/run"]);
        assert!(matches!(Command::from_frame(&frame), Command::Invalid { .. }));

        let frame = Frame::new("gui", "START", ["/tmp/run", "[0, 1]"]);
        assert_eq!(
            Command::from_frame(&frame),
            Command::Start {
                folder: "/tmp/run".into(),
                channels: "[0, 1]".into()
            }
        );

        // Extra arguments are ignored for argument-less verbs
        let frame = Frame::new("gui", "PING", ["extra"]);
        assert_eq!(Command::from_frame(&frame), Command::Ping);
    }

    #[test]
    fn test_unknown_verb() {
        let frame = Frame::new("gui", "FROB", Vec::<String>::new());
        assert_eq!(
            Command::from_frame(&frame),
            Command::Invalid {
                verb: "FROB".into()
            }
        );
    }

    #[test]
    fn test_command_frame_encoding() {
        let cmd = Command::Start {
            folder: "/data/run1".into(),
            channels: "0,1".into(),
        };
        assert_eq!(Command::from_frame(&cmd.to_frame("gui")), cmd);
    }

    #[test]
    fn test_plotter_commands() {
        let frame = Frame::new("gui", "FILES", ["/tmp/run/ch00.dat", "/tmp/run/ch01.dat"]);
        assert_eq!(
            PlotterCommand::from_frame(&frame),
            PlotterCommand::Files(vec![
                PathBuf::from("/tmp/run/ch00.dat"),
                PathBuf::from("/tmp/run/ch01.dat")
            ])
        );
        let frame = Frame::new("gui", "DONE", Vec::<String>::new());
        assert_eq!(PlotterCommand::from_frame(&frame), PlotterCommand::Done);
    }

    #[test]
    fn test_files_without_names_is_invalid() {
        let frame = Frame::new("gui", "FILES", Vec::<String>::new());
        assert_eq!(
            PlotterCommand::from_frame(&frame),
            PlotterCommand::Invalid("FILES".to_string())
        );
    }

    #[test]
    fn test_error_reply_carries_kind() {
        let reply = Reply::from_error(FILE_EXISTS, &DaqError::OutputFileExists("/x/ch00.dat".into()));
        let frame = reply.to_frame(SERVER_ID);
        assert_eq!(frame.verb_str(), "ERR");
        assert_eq!(frame.arg_str(1).as_deref(), Some("validation_failed"));

        let decoded = Reply::from_frame(&frame).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.text(), FILE_EXISTS);
    }
}
