// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod instrument;
pub mod matcher;
pub mod serial;
pub mod stream;
pub mod trigger;

pub use cdc_currentmon_protocols as protocols;

pub use {
    instrument::{Callbacks, DeviceApp, Instrument, LogRecord, PingInfo},
    matcher::CommandReply,
    trigger::AcquisitionData,
};

/// Failure in the driver runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire protocol: {0}")]
    Protocol(#[from] cdc_currentmon_protocols::Error),
    /// The command received no response within its wait budget.
    #[error("command {0:?} timed out")]
    Timeout(String),
    /// The serial worker stopped, usually because the device disconnected.
    #[error("serial worker is not running")]
    NotRunning,
    /// No completed acquisition window is waiting for the caller.
    #[error("no acquisition data is ready")]
    NotReady,
    /// Self calibration kept reporting in-progress until the poll budget
    /// ran out.
    #[error("calibration did not complete")]
    CalibrationIncomplete,
}

/// Sink for outbound frames, tagged with their destination port.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, port: u8, payload: &[u8]) -> Result<(), Error>;
}
