// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod adc;
pub mod cobs;
pub mod command;
pub mod mux;
pub mod params;
pub mod value;

/// Stream index assignments used by the instrument firmware.
pub mod port {
    /// Command requests and their responses.
    pub const CONTROL: u8 = 0;
    /// Asynchronous notifications from the firmware.
    pub const ASYNC: u8 = 1;
    /// Debug plot stream.
    pub const PLOT: u8 = 2;
    /// Sampled data stream.
    pub const ADC: u8 = 3;
}

/// Failure while encoding or decoding the wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A group length pointed beyond the end of the stuffed frame.
    #[error("truncated COBS group")]
    CobsTruncated,
    /// A zero byte appeared inside a stuffed frame.
    #[error("stray zero byte in COBS frame")]
    CobsStrayZero,
    /// The frame carried no bytes after deframing.
    #[error("empty frame")]
    EmptyFrame,
    /// A log-tagged frame was shorter than its address word.
    #[error("log frame too short: {0} bytes")]
    ShortLogFrame(usize),
    #[error("CBOR decode failed: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),
    /// The payload should have been a definite-length CBOR map.
    #[error("payload is not a CBOR map")]
    NotMap,
    #[error("field {0:?} is missing")]
    MissingField(&'static str),
    #[error("field {0:?} has an unexpected type")]
    FieldType(&'static str),
    /// A packed sample channel had a length not divisible by its item size.
    #[error("channel {0:?} has {1} bytes, not a multiple of {2}")]
    ChannelLength(&'static str, usize, usize),
    /// The channels of one sample packet disagree about the sample count.
    #[error("sample packet channels have mismatched lengths")]
    ChannelMismatch,
}
