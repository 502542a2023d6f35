// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Port multiplexing over the zero-delimited frame stream.
//!
//! The two low bits of the first byte classify a frame. Port traffic
//! carries the port index in the upper six bits and its payload follows
//! the tag. Any other classification marks a record from the firmware
//! logger whose first four bytes, the tag included, are the little-endian
//! address of the originating log statement.

use super::*;

/// Frame type field value for multiplexed port traffic.
pub const FRAME_TYPE_PORT: u8 = 0x03;

/// Number of ports available on the link.
pub const PORT_COUNT: u8 = 8;

/// Bit position of the target digit inside a log record address.
pub const TARGET_DIGIT_SHIFT: u32 = 20;

/// Classified content of one deframed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxFrame<'a> {
    /// Payload addressed to one of the multiplexed ports.
    Port { port: u8, payload: &'a [u8] },
    /// Record from the firmware logger.
    Log { target: u8, addr: u32, payload: &'a [u8] },
}

/// Classify a deframed frame.
pub fn decode(frame: &[u8]) -> Result<MuxFrame<'_>, Error> {
    let tag = *frame.first().ok_or(Error::EmptyFrame)?;
    if tag & 0x3 == FRAME_TYPE_PORT {
        Ok(MuxFrame::Port {
            port: tag >> 2,
            payload: &frame[1..],
        })
    } else if frame.len() >= 4 {
        let addr = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        Ok(MuxFrame::Log {
            target: ((addr >> TARGET_DIGIT_SHIFT) & 0xf) as u8,
            addr,
            payload: &frame[4..],
        })
    } else {
        Err(Error::ShortLogFrame(frame.len()))
    }
}

/// Prefix a payload with the tag of the given port.
pub fn encode(port: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push((port << 2) | FRAME_TYPE_PORT);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn port_round_trip() {
        (0..PORT_COUNT).for_each(|port| {
            let frame = encode(port, b"payload");
            assert_eq!(
                decode(&frame).unwrap(),
                MuxFrame::Port {
                    port,
                    payload: b"payload",
                }
            );
        });
    }

    #[test]
    fn empty_payload_round_trip() {
        let frame = encode(5, &[]);
        assert_eq!(
            decode(&frame).unwrap(),
            MuxFrame::Port {
                port: 5,
                payload: &[],
            }
        );
    }

    #[test]
    fn log_frame_address() {
        // Address 0x0730_01f8 has target digit 3 and a non-port low field.
        let addr = 0x0730_01f8u32;
        let mut frame = addr.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(
            decode(&frame).unwrap(),
            MuxFrame::Log {
                target: 3,
                addr,
                payload: &[0xde, 0xad],
            }
        );
    }

    #[test]
    fn short_log_frame_is_rejected() {
        assert!(matches!(
            decode(&[0x00, 0x01]),
            Err(Error::ShortLogFrame(2))
        ));
        assert!(matches!(decode(&[]), Err(Error::EmptyFrame)));
    }
}
