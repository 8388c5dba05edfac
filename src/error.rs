//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the control plane
//! and the live histogram pipeline. Using the `thiserror` crate, it provides a
//! centralized and consistent way to handle the different kinds of errors that can
//! occur, from configuration problems to an unreachable digitizer.
//!
//! ## Error Kinds
//!
//! Responses sent back over the command channel carry a human-readable text and a
//! closed [`ErrorKind`] so that clients can branch on the kind instead of parsing
//! text:
//!
//! - **`ConnectionFailed`**: the digitizer could not be reached, including retry
//!   exhaustion during start-up.
//! - **`ValidationFailed`**: malformed channel lists, out-of-range channels, stale
//!   output files, malformed commands and invalid configuration files.
//! - **`ProtocolViolation`**: a well-formed command that is not valid in the current
//!   state, e.g. `STOP` while not acquiring.
//! - **`ResourceError`**: file and directory failures and task spawn failures.
//! - **`Dropped`**: a snapshot superseded in its slot before the consumer drained it.
//!   Never surfaced to clients.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Settings(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resource error on {path}: {source}")]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Device unreachable after {attempts} connection attempts")]
    ConnectionFailed { attempts: u32 },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid device config: {0}")]
    InvalidDeviceConfig(String),

    #[error("Invalid channel list '{0}'")]
    InvalidChannelList(String),

    #[error("{0} is not a valid channel number")]
    ChannelOutOfRange(i64),

    #[error("File {} exists and not empty", .0.display())]
    OutputFileExists(PathBuf),

    #[error("{0}")]
    Protocol(String),

    #[error("File {} is already monitored", .0.display())]
    AlreadyMonitored(PathBuf),

    #[error("File {} is not monitored", .0.display())]
    NotMonitored(PathBuf),

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Pending snapshot superseded before it was drained")]
    SnapshotDropped,

    #[error("Snapshot slot closed")]
    SlotClosed,

    #[error("Event decode error: {0}")]
    Decode(String),

    #[error("Frame error: {0}")]
    Frame(String),
}

impl DaqError {
    /// Builds a resource error for a failed filesystem operation on `path`.
    pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaqError::Resource {
            path: path.into(),
            source,
        }
    }

    /// Classifies the error into the closed set of kinds reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::ConnectionFailed { .. } | DaqError::Device(_) => ErrorKind::ConnectionFailed,
            DaqError::Settings(_)
            | DaqError::Configuration(_)
            | DaqError::Json(_)
            | DaqError::InvalidDeviceConfig(_)
            | DaqError::InvalidChannelList(_)
            | DaqError::ChannelOutOfRange(_)
            | DaqError::OutputFileExists(_)
            | DaqError::AlreadyMonitored(_)
            | DaqError::NotMonitored(_)
            | DaqError::Decode(_)
            | DaqError::Frame(_) => ErrorKind::ValidationFailed {
                reason: self.to_string(),
            },
            DaqError::Protocol(_) => ErrorKind::ProtocolViolation,
            DaqError::Io(_)
            | DaqError::Resource { .. }
            | DaqError::SpawnFailed(_)
            | DaqError::SlotClosed => ErrorKind::ResourceError {
                detail: self.to_string(),
            },
            DaqError::SnapshotDropped => ErrorKind::Dropped,
        }
    }
}

/// Closed classification of failures carried next to response text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Device unreachable.
    ConnectionFailed,
    /// Input rejected locally, state unchanged.
    ValidationFailed {
        /// Why the input was rejected.
        reason: String,
    },
    /// Command not valid in the current protocol state.
    ProtocolViolation,
    /// Filesystem or task resource failure.
    ResourceError {
        /// What failed.
        detail: String,
    },
    /// Snapshot superseded in its slot.
    Dropped,
}

impl ErrorKind {
    /// Short wire tag used in `ERR` response frames.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::ValidationFailed { .. } => "validation_failed",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::ResourceError { .. } => "resource_error",
            ErrorKind::Dropped => "dropped",
        }
    }

    /// Rebuilds a kind from its wire tag and an optional detail string.
    pub fn from_tag(tag: &str, detail: &str) -> Option<Self> {
        let kind = match tag {
            "connection_failed" => ErrorKind::ConnectionFailed,
            "validation_failed" => ErrorKind::ValidationFailed {
                reason: detail.to_string(),
            },
            "protocol_violation" => ErrorKind::ProtocolViolation,
            "resource_error" => ErrorKind::ResourceError {
                detail: detail.to_string(),
            },
            "dropped" => ErrorKind::Dropped,
            _ => return None,
        };
        Some(kind)
    }

    /// Detail string carried by the kind, empty for unit kinds.
    pub fn detail(&self) -> &str {
        match self {
            ErrorKind::ValidationFailed { reason } => reason,
            ErrorKind::ResourceError { detail } => detail,
            _ => "",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            "" => write!(f, "{}", self.tag()),
            detail => write!(f, "{}: {}", self.tag(), detail),
        }
    }
}
