//! Core library for the sis3316_daq application.
//!
//! This library contains the control plane of the SIS3316 digitizer readout
//! server and the live histogram pipeline that follows the files it writes. It is
//! used by the `readout_server`, `live_plot` and `daqctl` binaries.

pub mod config;
pub mod decoder;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod histogram;
pub mod live_plot;
pub mod logging;
pub mod messages;
pub mod parser;
pub mod protocol;
pub mod readout;
pub mod session;
pub mod slot;
pub mod transport;
